//! Stream decoder
//!
//! Remote output arrives in arbitrary chunks: a line, a UTF-8 sequence or an
//! escape can be split anywhere. The decoder buffers until a raw line is
//! complete, then
//!
//! 1. expands `_xHHHH_` escapes, which the remote shell's structured output
//!    mode uses for control characters (`_x000D__x000A_` is CRLF),
//! 2. splits on the line breaks that produces,
//! 3. drops blank lines and the `#< CLIXML` stream marker,
//! 4. parses lines that look like a result envelope.
//!
//! Because escapes never contain a raw newline, working on complete raw lines
//! makes the result independent of how the input was chunked.

use fleet_core::domain::envelope::JobResultEnvelope;
use std::collections::VecDeque;
use std::collections::vec_deque::Drain;

const CLIXML_MARKER: &str = "#< CLIXML";

/// A clean output line, plus the parsed envelope when the line is one
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLine {
    pub text: String,
    pub result: Option<JobResultEnvelope>,
}

/// Stateful decoder for one command's output stream
#[derive(Debug, Default)]
pub struct StreamDecoder {
    /// Trailing bytes of an incomplete UTF-8 sequence
    partial: Vec<u8>,
    /// Decoded text of the current, unterminated raw line
    line: String,
    ready: VecDeque<DecodedLine>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and yields every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Drain<'_, DecodedLine> {
        self.partial.extend_from_slice(bytes);
        let text = self.decode_available();
        self.absorb(&text);
        self.ready.drain(..)
    }

    /// Ends the stream, yielding whatever was still buffered
    pub fn flush(&mut self) -> Drain<'_, DecodedLine> {
        if !self.partial.is_empty() {
            let tail = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.line.push_str(&tail);
        }
        let last = std::mem::take(&mut self.line);
        self.emit_raw_line(&last);
        self.ready.drain(..)
    }

    /// Discards all buffered state so the instance can decode a new stream
    pub fn reset(&mut self) {
        self.partial.clear();
        self.line.clear();
        self.ready.clear();
    }

    /// Decodes as much of `partial` as is valid, replacing invalid sequences
    fn decode_available(&mut self) -> String {
        let mut out = String::new();
        let mut rest: &[u8] = &self.partial;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.partial = rest.to_vec();
        out
    }

    fn absorb(&mut self, text: &str) {
        let mut remaining = text;
        while let Some(pos) = remaining.find('\n') {
            self.line.push_str(&remaining[..pos]);
            let raw = std::mem::take(&mut self.line);
            self.emit_raw_line(&raw);
            remaining = &remaining[pos + 1..];
        }
        self.line.push_str(remaining);
    }

    fn emit_raw_line(&mut self, raw: &str) {
        let expanded = unescape(raw);
        for piece in expanded.split('\n') {
            let piece = piece.trim_end_matches('\r');
            if piece.trim().is_empty() || piece.starts_with(CLIXML_MARKER) {
                continue;
            }
            self.ready.push_back(DecodedLine {
                text: piece.to_string(),
                result: JobResultEnvelope::parse_line(piece),
            });
        }
    }
}

/// Expands `_xHHHH_` escapes; malformed escapes are kept literally
fn unescape(raw: &str) -> String {
    if !raw.contains("_x") {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("_x") {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        match decode_escape(candidate) {
            Some(ch) => {
                out.push(ch);
                rest = &candidate[7..];
            }
            None => {
                out.push_str("_x");
                rest = &candidate[2..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_escape(candidate: &str) -> Option<char> {
    let bytes = candidate.as_bytes();
    if bytes.len() < 7 || bytes[6] != b'_' {
        return None;
    }
    let hex = candidate.get(2..6)?;
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::domain::envelope::ResultStatus;

    fn decode_all(chunks: &[&[u8]]) -> Vec<DecodedLine> {
        let mut decoder = StreamDecoder::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(decoder.push(chunk));
        }
        lines.extend(decoder.flush());
        lines
    }

    #[test]
    fn test_single_push_and_byte_by_byte_are_identical() {
        let input = b"{\"status\":\"success\"}\n";

        let whole = decode_all(&[&input[..]]);
        let bytes: Vec<&[u8]> = input.chunks(1).collect();
        let split = decode_all(&bytes);

        assert_eq!(whole.len(), 1);
        assert_eq!(whole, split);
        assert_eq!(whole[0].text, "{\"status\":\"success\"}");
        assert_eq!(
            whole[0].result.as_ref().map(|r| r.status),
            Some(ResultStatus::Success)
        );
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.push(b"Creating v").count(), 0);
        let lines: Vec<_> = decoder.push(b"m web-01\r\nAttach").collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "Creating vm web-01");
        assert!(lines[0].result.is_none());

        let rest: Vec<_> = decoder.flush().collect();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].text, "Attach");
    }

    #[test]
    fn test_multibyte_sequence_split_across_chunks() {
        let text = "Größe ✓\n".as_bytes();
        let bytes: Vec<&[u8]> = text.chunks(1).collect();
        let lines = decode_all(&bytes);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "Größe ✓");
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let lines = decode_all(&[&b"bad \xff byte\n"[..], &b"tail \xe2\x9c"[..]]);
        assert_eq!(lines[0].text, "bad \u{FFFD} byte");
        assert_eq!(lines[1].text, "tail \u{FFFD}");
    }

    #[test]
    fn test_hex_escapes_expand_and_split_lines() {
        let input = b"#< CLIXML\nfirst_x000D__x000A_second_x0009_tabbed\n";
        let whole = decode_all(&[&input[..]]);
        let bytes: Vec<&[u8]> = input.chunks(3).collect();
        let split = decode_all(&bytes);

        assert_eq!(whole, split);
        let texts: Vec<&str> = whole.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second\ttabbed"]);
    }

    #[test]
    fn test_malformed_escapes_are_literal() {
        assert_eq!(unescape("name_xZZZZ_here"), "name_xZZZZ_here");
        assert_eq!(unescape("short_x00"), "short_x00");
        assert_eq!(unescape("under_x005F_score"), "under_score");
        assert_eq!(unescape("surrogate_xD800_"), "surrogate_xD800_");
    }

    #[test]
    fn test_blank_lines_are_dropped_and_plain_json_is_not_a_result() {
        let lines = decode_all(&[&b"\n\r\n  \n{\"progress\": 10}\n"[..]]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].result.is_none());
    }

    #[test]
    fn test_reset_discards_buffered_state() {
        let mut decoder = StreamDecoder::new();
        let _ = decoder.push(b"half a li");
        decoder.reset();
        let lines: Vec<_> = decoder.push(b"fresh\n").collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "fresh");
        assert_eq!(decoder.flush().count(), 0);
    }
}

//! Remote executor seam
//!
//! A remote executor opens a session to one host, runs one command and blocks
//! until it finishes. Output is pushed incrementally into an [`OutputSink`] so
//! the caller can decode and record lines while the command is still running.
//!
//! The control plane only depends on the [`RemoteExecutor`] trait; transports
//! (SSH, WinRM, a local helper process) plug in behind it.

mod process;

pub use process::ProcessExecutor;

use tokio::sync::mpsc;

/// One command destined for one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub host: String,
    /// Operation name, available to transports that route by operation
    pub operation: String,
    /// Serialized request envelope
    pub payload: String,
}

/// Errors raised by an executor before or while running a command
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("cannot reach host {host}: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("failed to start remote command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("remote session I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("remote command terminated by signal")]
    Terminated,
}

/// Standard stream a chunk was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Raw bytes read from the remote session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub bytes: Vec<u8>,
}

/// Sending half of a command's output stream
///
/// Once the receiving side is gone (the task timed out or was cancelled) every
/// further chunk is dropped; executors may check [`OutputSink::is_discarded`]
/// to stop early but are not required to.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<OutputChunk>,
}

impl OutputSink {
    /// Creates a sink and the receiver the caller drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutputChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn stdout(&self, bytes: &[u8]) {
        self.push(OutputStream::Stdout, bytes);
    }

    pub fn stderr(&self, bytes: &[u8]) {
        self.push(OutputStream::Stderr, bytes);
    }

    pub fn push(&self, stream: OutputStream, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let _ = self.tx.send(OutputChunk {
            stream,
            bytes: bytes.to_vec(),
        });
    }

    pub fn is_discarded(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Blocking, session-based command execution against one host
pub trait RemoteExecutor: Send + Sync {
    /// Runs `command`, streaming output into `sink`, and returns the exit code
    fn execute(&self, command: &RemoteCommand, sink: &OutputSink) -> Result<i32, ExecutorError>;

    /// Cheap connectivity check run before a job is dispatched
    fn probe(&self, _host: &str) -> Result<(), ExecutorError> {
        Ok(())
    }
}

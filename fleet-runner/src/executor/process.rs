//! Process-backed executor
//!
//! Runs a local program per command (typically `ssh`, `pwsh` or a site
//! specific wrapper) that owns the actual remote session. The request payload
//! is written to the program's stdin; stdout and stderr are streamed back as
//! they are produced.
//!
//! Argument templates may contain `{host}` and `{operation}` placeholders.

use std::io::{Read, Write};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use super::{ExecutorError, OutputSink, OutputStream, RemoteCommand, RemoteExecutor};

const READ_BUFFER_SIZE: usize = 4096;

/// Executor that delegates each remote session to a child process
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    probe: Option<(String, Vec<String>)>,
}

impl ProcessExecutor {
    /// Creates an executor running `program` with templated `args`
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            probe: None,
        }
    }

    /// Parses a whitespace separated template such as `ssh {host} fleet-agent`
    ///
    /// Quoting is not supported; use [`ProcessExecutor::new`] for arguments
    /// containing spaces.
    pub fn from_template(template: &str) -> Option<Self> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    /// Sets the connectivity probe command, e.g. `ssh {host} true`
    pub fn with_probe_template(mut self, template: &str) -> Self {
        let mut parts = template.split_whitespace().map(str::to_string);
        self.probe = parts.next().map(|program| (program, parts.collect()));
        self
    }

    fn render(args: &[String], host: &str, operation: &str) -> Vec<String> {
        args.iter()
            .map(|arg| arg.replace("{host}", host).replace("{operation}", operation))
            .collect()
    }
}

impl RemoteExecutor for ProcessExecutor {
    fn execute(&self, command: &RemoteCommand, sink: &OutputSink) -> Result<i32, ExecutorError> {
        let args = Self::render(&self.args, &command.host, &command.operation);
        debug!(
            "Starting remote command for {} on {}: {} {:?}",
            command.operation, command.host, self.program, args
        );

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ExecutorError::Spawn)?;
        let mut child = Reaper::new(child);

        // Both readers run before the request is written, so an agent that
        // talks before it reads never fills a pipe nobody drains
        let stdout_reader = child.stdout().map(|pipe| {
            let sink = sink.clone();
            thread::spawn(move || pump(pipe, OutputStream::Stdout, &sink))
        });
        let stderr_reader = child.stderr().map(|pipe| {
            let sink = sink.clone();
            thread::spawn(move || pump(pipe, OutputStream::Stderr, &sink))
        });
        let stdin_writer = child.stdin().map(|mut stdin| {
            let payload = command.payload.clone();
            let host = command.host.clone();
            // Dropping stdin after the write signals end of request to the agent
            thread::spawn(move || {
                let written = stdin
                    .write_all(payload.as_bytes())
                    .and_then(|_| stdin.write_all(b"\n"));
                match written {
                    // The agent exited without reading its request; its exit code tells the rest
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        debug!("Remote command on {} closed stdin early", host);
                        Ok(())
                    }
                    other => other,
                }
            })
        });

        let written = join(stdin_writer, "stdin writer", &command.host);
        if written.is_err() {
            child.kill();
        }
        let stdout = join(stdout_reader, "stdout reader", &command.host);
        if stdout.is_err() {
            child.kill();
        }
        let stderr = join(stderr_reader, "stderr reader", &command.host);

        let status = child.wait()?;
        written?;
        stdout?;
        stderr?;

        let code = status.code().ok_or(ExecutorError::Terminated)?;
        debug!("Remote command on {} exited with {}", command.host, code);
        Ok(code)
    }

    fn probe(&self, host: &str) -> Result<(), ExecutorError> {
        let Some((program, args)) = &self.probe else {
            return Ok(());
        };

        let output = Command::new(program)
            .args(Self::render(args, host, "probe"))
            .stdin(Stdio::null())
            .output()
            .map_err(ExecutorError::Spawn)?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = if stderr.trim().is_empty() {
            format!("probe exited with {:?}", output.status.code())
        } else {
            stderr.trim().to_string()
        };
        Err(ExecutorError::Unreachable {
            host: host.to_string(),
            reason,
        })
    }
}

/// Owns a spawned child; kills and reaps it on drop unless it was waited for
struct Reaper {
    child: Child,
    reaped: bool,
}

impl Reaper {
    fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    fn stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    fn stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("Failed to kill remote command {}: {}", self.child.id(), e);
        }
    }

    fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill();
            if let Err(e) = self.child.wait() {
                warn!("Failed to reap remote command {}: {}", self.child.id(), e);
            }
        }
    }
}

fn join(
    handle: Option<JoinHandle<std::io::Result<()>>>,
    role: &str,
    host: &str,
) -> std::io::Result<()> {
    match handle.map(JoinHandle::join) {
        Some(Ok(result)) => result,
        Some(Err(_)) => {
            warn!("{} for {} panicked", role, host);
            Ok(())
        }
        None => Ok(()),
    }
}

fn pump(mut reader: impl Read, stream: OutputStream, sink: &OutputSink) -> std::io::Result<()> {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => sink.push(stream, &buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

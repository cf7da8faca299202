//! Command interpreter lifecycle.
//!
//! The interpreter is spawned exactly once. Its stdin is fed from an input
//! queue and its stdout and stderr share a single OS pipe, so whatever it
//! prints reaches the chain as one merged stream.

use std::fs::File;
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use mshell_core::Frame;
use mshell_core::config::InterpreterConfig;

/// Capacity of the interpreter output queue, in chunks.
pub const OUTPUT_CAPACITY: usize = 64;

/// The interpreter as seen by the chain: one input queue and one output
/// queue. Exactly one session ever holds these.
#[derive(Debug)]
pub struct InterpreterLink {
    /// Bytes to write to the interpreter's stdin.
    pub input: mpsc::UnboundedSender<Bytes>,
    /// Merged stdout/stderr chunks.
    pub output: mpsc::Receiver<Frame>,
}

impl InterpreterLink {
    /// A link whose far ends are returned to the caller instead of being
    /// attached to a process.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Bytes>, mpsc::Sender<Frame>) {
        let (input, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output) = mpsc::channel(OUTPUT_CAPACITY);
        (Self { input, output }, input_rx, output_tx)
    }
}

/// Handle to the running interpreter process.
#[derive(Debug)]
pub struct InterpreterHost {
    child: Child,
    program: String,
    terminate_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl InterpreterHost {
    /// Spawn the interpreter and wire it to a fresh [`InterpreterLink`].
    pub fn spawn(
        config: &InterpreterConfig,
        buffer_size: usize,
        terminate_timeout: Duration,
    ) -> Result<(Self, InterpreterLink), InterpreterError> {
        let spawn_failed = |e: std::io::Error| InterpreterError::SpawnFailed {
            program: config.program.clone(),
            reason: e.to_string(),
        };

        let (output_reader, output_writer) = std::io::pipe().map_err(spawn_failed)?;
        let error_writer = output_writer.try_clone().map_err(spawn_failed)?;

        let mut child = {
            let mut cmd = Command::new(&config.program);
            cmd.args(&config.args)
                .stdin(Stdio::piped())
                .stdout(output_writer)
                .stderr(error_writer)
                .process_group(0)
                .kill_on_drop(true);
            info!(program = %config.program, args = ?config.args, "Spawning interpreter");
            cmd.spawn().map_err(spawn_failed)?
            // `cmd` drops here, closing our copies of the write end.
        };

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| InterpreterError::SpawnFailed {
                program: config.program.clone(),
                reason: "Failed to capture stdin".to_string(),
            })?;
        let output = pipe::Receiver::from_file(File::from(OwnedFd::from(output_reader)))
            .map_err(spawn_failed)?;

        let (link, input_rx, output_tx) = InterpreterLink::detached();
        let span = info_span!("interpreter", pid = child.id());
        let tasks = vec![
            tokio::spawn(write_input(stdin, input_rx).instrument(span.clone())),
            tokio::spawn(read_output(output, output_tx, buffer_size.max(1)).instrument(span)),
        ];

        Ok((
            Self {
                child,
                program: config.program.clone(),
                terminate_timeout,
                tasks,
            },
            link,
        ))
    }

    /// OS process id, while the child is running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the interpreter to exit on its own. Cancel-safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Stop the interpreter: SIGTERM, then SIGKILL after the timeout.
    pub async fn terminate(mut self) -> Result<(), InterpreterError> {
        if let Some(pid) = self.child.id() {
            match i32::try_from(pid) {
                Ok(raw) => {
                    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                        warn!(pid, error = %e, "Failed to send SIGTERM");
                    }
                }
                Err(_) => warn!(pid, "Process id out of range for kill(2)"),
            }
        }

        let result = match tokio::time::timeout(self.terminate_timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(program = %self.program, ?status, "Interpreter exited");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for interpreter");
                self.child.kill().await.ok();
                Err(InterpreterError::Wait {
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!("Timeout waiting for interpreter shutdown, killing");
                self.child.kill().await.ok();
                Ok(())
            }
        };

        for task in self.tasks.drain(..) {
            task.abort();
        }
        result
    }
}

async fn write_input(mut stdin: ChildStdin, mut input: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(bytes) = input.recv().await {
        if let Err(e) = stdin.write_all(&bytes).await {
            warn!(error = %e, "Failed to write to interpreter stdin");
            break;
        }
        if let Err(e) = stdin.flush().await {
            warn!(error = %e, "Failed to flush interpreter stdin");
            break;
        }
    }
    debug!("Interpreter input closed");
}

async fn read_output(mut output: pipe::Receiver, tx: mpsc::Sender<Frame>, buffer_size: usize) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        match output.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Frame::data(&buf[..n])).await.is_err() {
                    debug!("Interpreter output has no reader left");
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read interpreter output");
                break;
            }
        }
    }
    debug!("Interpreter output finished");
}

/// Errors from interpreter operations.
#[derive(Debug, thiserror::Error)]
pub enum InterpreterError {
    #[error("Failed to spawn interpreter {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Failed waiting for interpreter: {reason}")]
    Wait { reason: String },
}

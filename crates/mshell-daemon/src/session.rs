//! Per-client session handler.
//!
//! Every admitted client gets one handler. Handlers form a linear chain in
//! join order; the first one (the root) is the only holder of the
//! interpreter link. Each handler owns six endpoints:
//!
//! | endpoint     | carries                                               |
//! |--------------|-------------------------------------------------------|
//! | `shell-in`   | interpreter output (root) or the predecessor's forward |
//! | `shell-out`  | everything this session saw, toward the successor      |
//! | `client-in`  | bytes typed by this session's client                   |
//! | `client-out` | bytes shown to this session's client                   |
//! | `pred-out`   | input toward the interpreter (root) or the predecessor |
//! | `pred-in`    | the successor's input, echoed back up the chain        |
//!
//! Client input funnels upward one hop at a time until the root hands it to
//! the interpreter, and is shown to every earlier client on the way. Output
//! flows down through `shell-out`, so every client sees the interpreter's
//! output and every later client sees the input too.

use std::ops::ControlFlow;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mshell_core::sentinel::{Chunk, classify, classify_payload_only};
use mshell_core::{BoxReader, BoxWriter, Channel, Endpoint, Frame};

use crate::config::RelayOptions;

/// Session identifier, assigned in join order starting at 1.
pub type SessionId = u64;

/// Where a session sends the input it relays upstream.
#[derive(Debug)]
pub enum Upstream {
    /// Root only: straight into the interpreter's stdin.
    Interpreter(mpsc::UnboundedSender<Bytes>),
    /// Everyone else: the predecessor's `pred-in`.
    Predecessor(mpsc::UnboundedSender<Frame>),
}

impl Upstream {
    /// Whether this link is the interpreter's input.
    pub const fn is_interpreter(&self) -> bool {
        matches!(self, Self::Interpreter(_))
    }

    fn send_data(&self, bytes: Bytes) {
        let delivered = match self {
            Self::Interpreter(tx) => tx.send(bytes).is_ok(),
            Self::Predecessor(tx) => tx.send(Frame::Data(bytes)).is_ok(),
        };
        if !delivered {
            debug!("Upstream already closed, input dropped");
        }
    }
}

/// Everything a handler needs, wired up by the chain at admission.
#[derive(Debug)]
pub struct SessionContext {
    pub id: SessionId,
    pub shell_in: mpsc::Receiver<Frame>,
    pub shell_out: mpsc::Sender<Frame>,
    pub client: Channel,
    pub pred_out: Upstream,
    pub pred_in: mpsc::UnboundedReceiver<Frame>,
}

/// Why a session left the relay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `shell-in` reached end-of-stream.
    ShellClosed,
    /// `shell-in` delivered a PANIC frame.
    ShellPanic,
    /// The client hung up, or writing to it failed.
    ClientClosed,
    /// The client sent the PANIC literal.
    ClientPanic,
    /// Reading from the client failed.
    ClientFailed,
    /// `pred-in` reached end-of-stream.
    PredClosed,
    /// The successor propagated PANIC.
    PredPanic,
}

/// Outcome reported to the supervisor when a handler finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionExit {
    pub id: SessionId,
    /// The root's exit terminates the whole server.
    pub root: bool,
    pub reason: CloseReason,
}

enum Event {
    Shell(Option<Frame>),
    Client(std::io::Result<usize>),
    Pred(Option<Frame>),
}

/// Relay state machine for one client.
pub struct SessionHandler {
    id: SessionId,
    root: bool,
    options: RelayOptions,
    shell_in: Endpoint<mpsc::Receiver<Frame>>,
    shell_out: Endpoint<mpsc::Sender<Frame>>,
    client_in: Endpoint<BoxReader>,
    client_out: Endpoint<BoxWriter>,
    pred_out: Endpoint<Upstream>,
    pred_in: Endpoint<mpsc::UnboundedReceiver<Frame>>,
    closed: bool,
}

impl std::fmt::Debug for SessionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandler")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl SessionHandler {
    pub fn new(ctx: SessionContext, options: RelayOptions) -> Self {
        let SessionContext {
            id,
            shell_in,
            shell_out,
            client,
            pred_out,
            pred_in,
        } = ctx;
        let root = pred_out.is_interpreter();
        let (client_in, client_out) = client.into_endpoints("client-in", "client-out");
        Self {
            id,
            root,
            options,
            shell_in: Endpoint::new("shell-in", shell_in),
            shell_out: Endpoint::new("shell-out", shell_out),
            client_in,
            client_out,
            pred_out: Endpoint::new("pred-out", pred_out),
            pred_in: Endpoint::new("pred-in", pred_in),
            closed: false,
        }
    }

    pub const fn id(&self) -> SessionId {
        self.id
    }

    pub const fn is_root(&self) -> bool {
        self.root
    }

    /// Relay until any source ends or signals PANIC, then close.
    pub async fn run(mut self) -> SessionExit {
        info!(root = self.root, "Session relaying");
        let reason = self.relay().await;
        self.close(reason).await;
        SessionExit {
            id: self.id,
            root: self.root,
            reason,
        }
    }

    async fn relay(&mut self) -> CloseReason {
        let mut buf = vec![0u8; self.options.buffer_size.max(1)];
        loop {
            let event = {
                let (Some(shell_in), Some(client_in), Some(pred_in)) = (
                    self.shell_in.get_mut(),
                    self.client_in.get_mut(),
                    self.pred_in.get_mut(),
                ) else {
                    return CloseReason::ClientClosed;
                };
                tokio::select! {
                    biased;
                    frame = shell_in.recv() => Event::Shell(frame),
                    read = client_in.read(&mut buf) => Event::Client(read),
                    frame = pred_in.recv() => Event::Pred(frame),
                }
            };

            let step = match event {
                Event::Shell(frame) => self.on_shell(frame).await,
                Event::Client(read) => self.on_client(read, &buf).await,
                Event::Pred(frame) => self.on_pred(frame).await,
            };
            if let ControlFlow::Break(reason) = step {
                return reason;
            }
        }
    }

    async fn on_shell(&mut self, frame: Option<Frame>) -> ControlFlow<CloseReason> {
        match frame {
            None => ControlFlow::Break(CloseReason::ShellClosed),
            Some(Frame::Panic) => ControlFlow::Break(CloseReason::ShellPanic),
            Some(Frame::Data(bytes)) => {
                if !self.write_client(&bytes).await {
                    return ControlFlow::Break(CloseReason::ClientClosed);
                }
                self.forward(bytes).await;
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_client(
        &mut self,
        read: std::io::Result<usize>,
        buf: &[u8],
    ) -> ControlFlow<CloseReason> {
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Client read failed");
                return ControlFlow::Break(CloseReason::ClientFailed);
            }
        };
        let chunk = if self.options.detect_wire_panic {
            classify(&buf[..n])
        } else {
            classify_payload_only(&buf[..n])
        };
        match chunk {
            Chunk::Eof => ControlFlow::Break(CloseReason::ClientClosed),
            Chunk::Panic => ControlFlow::Break(CloseReason::ClientPanic),
            Chunk::Data(data) => {
                let bytes = Bytes::copy_from_slice(data);
                self.forward(bytes.clone()).await;
                if let Some(upstream) = self.pred_out.get() {
                    upstream.send_data(bytes);
                }
                ControlFlow::Continue(())
            }
        }
    }

    async fn on_pred(&mut self, frame: Option<Frame>) -> ControlFlow<CloseReason> {
        match frame {
            None => ControlFlow::Break(CloseReason::PredClosed),
            Some(Frame::Panic) => ControlFlow::Break(CloseReason::PredPanic),
            Some(Frame::Data(bytes)) => {
                if !self.write_client(&bytes).await {
                    return ControlFlow::Break(CloseReason::ClientClosed);
                }
                if let Some(upstream) = self.pred_out.get() {
                    upstream.send_data(bytes);
                }
                ControlFlow::Continue(())
            }
        }
    }

    async fn write_client(&mut self, bytes: &[u8]) -> bool {
        let Some(writer) = self.client_out.get_mut() else {
            return false;
        };
        match writer.write_all(bytes).await {
            Ok(()) => writer.flush().await.is_ok(),
            Err(e) => {
                debug!(error = %e, "Client write failed");
                false
            }
        }
    }

    async fn forward(&mut self, bytes: Bytes) {
        if let Some(tx) = self.shell_out.get()
            && tx.send(Frame::Data(bytes)).await.is_err()
        {
            debug!("Successor gone, forward dropped");
        }
    }

    /// Release every endpoint exactly once and tell the predecessor.
    async fn close(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!(?reason, root = self.root, "Session closing");

        self.shell_out.close();
        self.shell_in.close();
        self.client_out.shutdown().await;
        self.client_in.close();
        if let Some(Upstream::Predecessor(tx)) = self.pred_out.get() {
            if tx.send(Frame::Panic).is_ok() {
                debug!("PANIC propagated to predecessor");
            } else {
                debug!("Predecessor already closed");
            }
        }
        self.pred_out.close();
        self.pred_in.close();
    }
}

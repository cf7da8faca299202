//! Chain bookkeeping for session admission.
//!
//! Sessions are linked in join order. The chain remembers two loose ends
//! between admissions: the upstream link the next session will send its
//! input to, and the tail of the output stream the next session will read.
//! Until somebody joins, the tail is parked on a drain task so the newest
//! session (or the interpreter, before anyone joined) never blocks on a
//! successor that does not exist yet.

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, trace};

use mshell_core::{Channel, Frame};

use crate::config::RelayOptions;
use crate::interpreter::InterpreterLink;
use crate::session::{SessionContext, SessionHandler, SessionId, Upstream};

/// Capacity of each session-to-successor link, in chunks.
pub const FORWARD_CAPACITY: usize = 64;

/// An output stream with no reader yet. Chunks sent before the stream is
/// reclaimed are discarded, so a new reader only sees what follows.
#[derive(Debug)]
pub struct ParkedTail {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<mpsc::Receiver<Frame>>,
}

impl ParkedTail {
    pub fn park(mut rx: mpsc::Receiver<Frame>) -> Self {
        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut discarded = 0usize;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => {
                        while let Ok(frame) = rx.try_recv() {
                            if let Frame::Data(bytes) = frame {
                                discarded += bytes.len();
                            }
                        }
                        break;
                    }
                    frame = rx.recv() => match frame {
                        Some(Frame::Data(bytes)) => discarded += bytes.len(),
                        Some(Frame::Panic) => trace!("PANIC on an unclaimed tail ignored"),
                        None => break,
                    },
                }
            }
            if discarded > 0 {
                debug!(bytes = discarded, "Discarded output with no successor");
            }
            rx
        });
        Self { stop, handle }
    }

    /// Stop draining and hand the stream to its new reader.
    pub async fn reclaim(self) -> Result<mpsc::Receiver<Frame>, JoinError> {
        // The drain task may already have finished on end-of-stream.
        let _ = self.stop.send(());
        self.handle.await
    }

    /// Drop the stream without ever reading it again.
    pub fn discard(self) {
        self.handle.abort();
    }
}

/// Loose ends of the session chain.
#[derive(Debug)]
pub struct Chain {
    upstream: Option<Upstream>,
    tail: Option<ParkedTail>,
    next_id: SessionId,
    options: RelayOptions,
}

impl Chain {
    /// Start an empty chain on the interpreter link. The first admitted
    /// session becomes the root.
    pub fn new(link: InterpreterLink, options: RelayOptions) -> Self {
        let InterpreterLink { input, output } = link;
        Self {
            upstream: Some(Upstream::Interpreter(input)),
            tail: Some(ParkedTail::park(output)),
            next_id: 1,
            options,
        }
    }

    /// Number of sessions admitted so far.
    pub const fn admitted(&self) -> u64 {
        self.next_id - 1
    }

    /// Wire `client` in as the newest session.
    pub async fn admit(&mut self, client: Channel) -> Result<SessionHandler, ChainError> {
        let (Some(upstream), Some(tail)) = (self.upstream.take(), self.tail.take()) else {
            return Err(ChainError::Broken);
        };
        let shell_in = tail
            .reclaim()
            .await
            .map_err(|e| ChainError::TailLost(e.to_string()))?;

        let (shell_out, next_shell_in) = mpsc::channel(FORWARD_CAPACITY);
        let (next_upstream, pred_in) = mpsc::unbounded_channel();

        let id = self.next_id;
        self.next_id += 1;
        self.tail = Some(ParkedTail::park(next_shell_in));
        self.upstream = Some(Upstream::Predecessor(next_upstream));

        let ctx = SessionContext {
            id,
            shell_in,
            shell_out,
            client,
            pred_out: upstream,
            pred_in,
        };
        Ok(SessionHandler::new(ctx, self.options))
    }

    /// Let go of both loose ends. The newest session sees its `pred-in`
    /// end, and an unadmitted interpreter sees its input close.
    pub fn dismantle(mut self) {
        if let Some(tail) = self.tail.take() {
            tail.discard();
        }
        drop(self.upstream.take());
    }
}

/// Errors from chain operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Session chain is broken")]
    Broken,

    #[error("Failed to reclaim chain tail: {0}")]
    TailLost(String),
}

//! Accept loop and session supervisor.
//!
//! A dedicated acceptor task runs handshakes one at a time and hands each
//! joined client to the supervisor. The supervisor wires clients into the
//! chain, spawns their handlers, and reaps them as they finish. When the
//! root session finishes the whole server shuts down.

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::{Id as TaskId, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};

use mshell_core::{Channel, Listener};

use crate::chain::Chain;
use crate::config::ServerConfig;
use crate::interpreter::InterpreterLink;
use crate::session::{CloseReason, SessionExit};

/// Counters kept by the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Clients wired into the chain.
    pub admitted: u64,
    /// Clients turned away by the session limit.
    pub rejected: u64,
    /// Finished session handlers collected.
    pub reaped: u64,
}

/// Why the server stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// The root session closed.
    RootClosed(CloseReason),
    /// The root session's task failed before reporting.
    RootFailed(String),
    /// The caller's shutdown future completed.
    Requested,
    /// The listener has no more clients to offer.
    ListenerClosed,
    /// The listener hit a fatal error.
    ListenerFailed,
    /// Admission could not wire a client into the chain.
    ChainBroken(String),
}

/// Summary returned when the server stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReport {
    pub cause: ShutdownCause,
    pub stats: ServerStats,
}

/// Multi-client shell server.
#[derive(Debug)]
pub struct Server<L> {
    listener: L,
    config: ServerConfig,
}

impl<L: Listener + 'static> Server<L> {
    pub const fn new(listener: L, config: ServerConfig) -> Self {
        Self { listener, config }
    }

    /// Serve until the root session closes or `shutdown` completes.
    ///
    /// Returns an error only when the listener hits a failure that is fatal
    /// to the server, such as being unable to create the rendezvous.
    pub async fn run<S>(
        self,
        link: InterpreterLink,
        shutdown: S,
    ) -> Result<ServerReport, ServerError>
    where
        S: Future<Output = ()>,
    {
        let Self { listener, config } = self;
        let mut chain = Chain::new(link, config.relay);
        let (accepted_tx, mut accepted_rx) = mpsc::channel(1);
        let acceptor =
            tokio::spawn(accept_loop(listener, accepted_tx).instrument(info_span!("acceptor")));

        let mut sessions: JoinSet<SessionExit> = JoinSet::new();
        let mut root_task: Option<TaskId> = None;
        let mut stats = ServerStats::default();
        let mut listening = true;
        let mut fatal = None;
        tokio::pin!(shutdown);

        let cause = loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested");
                    break ShutdownCause::Requested;
                }
                accepted = accepted_rx.recv(), if listening => {
                    let client = match accepted {
                        Some(Ok(client)) => client,
                        Some(Err(e)) => {
                            fatal = Some(e);
                            break ShutdownCause::ListenerFailed;
                        }
                        None => {
                            listening = false;
                            if sessions.is_empty() {
                                break ShutdownCause::ListenerClosed;
                            }
                            debug!("Listener closed, serving remaining sessions");
                            continue;
                        }
                    };
                    if let Some(max) = config.max_sessions
                        && sessions.len() >= max
                    {
                        warn!(max, "Session limit reached, turning client away");
                        stats.rejected += 1;
                        drop(client);
                        continue;
                    }
                    let handler = match chain.admit(client).await {
                        Ok(handler) => handler,
                        Err(e) => {
                            error!(error = %e, "Failed to admit client");
                            break ShutdownCause::ChainBroken(e.to_string());
                        }
                    };
                    let id = handler.id();
                    let root = handler.is_root();
                    let task =
                        sessions.spawn(handler.run().instrument(info_span!("session", id)));
                    if root {
                        root_task = Some(task.id());
                    }
                    stats.admitted += 1;
                    info!(id, root, active = sessions.len(), "Session admitted");
                }
                Some(joined) = sessions.join_next_with_id() => {
                    stats.reaped += 1;
                    match joined {
                        Ok((_, exit)) => {
                            info!(
                                id = exit.id,
                                reason = ?exit.reason,
                                active = sessions.len(),
                                "Session reaped"
                            );
                            if exit.root {
                                break ShutdownCause::RootClosed(exit.reason);
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Session task failed");
                            if Some(e.id()) == root_task {
                                break ShutdownCause::RootFailed(e.to_string());
                            }
                        }
                    }
                    if !listening && sessions.is_empty() {
                        break ShutdownCause::ListenerClosed;
                    }
                }
            }
        };

        info!(?cause, "Server shutting down");
        acceptor.abort();
        chain.dismantle();
        drain(&mut sessions, &mut stats, &config).await;
        info!(
            admitted = stats.admitted,
            rejected = stats.rejected,
            reaped = stats.reaped,
            "Server stopped"
        );

        match fatal {
            Some(e) => Err(e),
            None => Ok(ServerReport { cause, stats }),
        }
    }
}

/// Run handshakes back to back and pass joined clients on.
async fn accept_loop<L: Listener>(
    mut listener: L,
    accepted: mpsc::Sender<Result<Channel, ServerError>>,
) {
    loop {
        let client = match listener.accept().await {
            Ok(client) => client,
            Err(mshell_core::Error::TransportClosed) => {
                debug!("Listener closed");
                return;
            }
            Err(e) if e.is_path_failure() => {
                error!(error = %e, "Listener failed");
                accepted.send(Err(ServerError::Listener(e))).await.ok();
                return;
            }
            Err(e) => {
                warn!(error = %e, "Handshake failed, waiting for the next client");
                continue;
            }
        };
        info!("Client joined");
        if accepted.send(Ok(client)).await.is_err() {
            return;
        }
    }
}

/// Wait for every remaining session to finish, aborting stragglers.
async fn drain(
    sessions: &mut JoinSet<SessionExit>,
    stats: &mut ServerStats,
    config: &ServerConfig,
) {
    let waited = tokio::time::timeout(config.drain_timeout, async {
        while let Some(joined) = sessions.join_next().await {
            stats.reaped += 1;
            match joined {
                Ok(exit) => debug!(id = exit.id, reason = ?exit.reason, "Session reaped"),
                Err(e) => warn!(error = %e, "Session task failed during shutdown"),
            }
        }
    })
    .await;

    if waited.is_err() {
        warn!(remaining = sessions.len(), "Sessions did not close in time, aborting");
        sessions.abort_all();
        while sessions.join_next().await.is_some() {
            stats.reaped += 1;
        }
    }
}

/// Errors that stop the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Listener failed: {0}")]
    Listener(#[source] mshell_core::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use mshell_core::transport::fifo::FifoListener;
    use mshell_core::transport::memory;
    use tokio::io::AsyncReadExt;
    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn requested_shutdown_with_no_sessions() {
        let (listener, _connector) = memory::pair();
        let (link, mut input, _output) = InterpreterLink::detached();
        let (stop, stopped) = oneshot::channel::<()>();
        let server = Server::new(listener, ServerConfig::default());
        let run = tokio::spawn(server.run(link, async {
            stopped.await.ok();
        }));

        stop.send(()).unwrap();
        let report = run.await.unwrap().unwrap();
        assert_eq!(report.cause, ShutdownCause::Requested);
        assert_eq!(report.stats, ServerStats::default());
        assert!(input.recv().await.is_none());
    }

    #[tokio::test]
    async fn listener_closing_stops_the_server() {
        let (listener, connector) = memory::pair();
        drop(connector);
        let (link, _input, _output) = InterpreterLink::detached();
        let server = Server::new(listener, ServerConfig::default());
        let report = server.run(link, std::future::pending()).await.unwrap();
        assert_eq!(report.cause, ShutdownCause::ListenerClosed);
    }

    #[tokio::test]
    async fn session_limit_turns_clients_away() {
        let (listener, connector) = memory::pair();
        let (link, _input, _output) = InterpreterLink::detached();
        let (stop, stopped) = oneshot::channel::<()>();
        let config = ServerConfig::default()
            .with_max_sessions(1)
            .with_drain_timeout(Duration::from_secs(2));
        let run = tokio::spawn(Server::new(listener, config).run(link, async {
            stopped.await.ok();
        }));

        let _first = connector.connect().await.unwrap();
        let mut second = connector.connect().await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), second.reader.read(&mut buf))
            .await
            .expect("rejected client was never closed")
            .unwrap();
        assert_eq!(n, 0);

        stop.send(()).unwrap();
        let report = run.await.unwrap().unwrap();
        assert_eq!(report.stats.admitted, 1);
        assert_eq!(report.stats.rejected, 1);
    }

    #[tokio::test]
    async fn unusable_rendezvous_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let listener = FifoListener::bind(dir.path().join("missing").join("rendezvous"));
        let (link, _input, _output) = InterpreterLink::detached();
        let err = Server::new(listener, ServerConfig::default())
            .run(link, std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Listener(mshell_core::Error::Rendezvous { .. })
        ));
    }
}

//! In-process transport built on `tokio::io::duplex`.
//!
//! Dialing mirrors the FIFO choreography: the connector registers a private
//! stream under a unique name, hands a rendezvous stream to the listener and
//! then both sides run the same handshake steps.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{DuplexStream, duplex};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::handshake;
use crate::transport::Listener;

/// Per-direction buffer of the in-process streams.
const STREAM_CAPACITY: usize = 64 * 1024;

type PrivateRegistry = Arc<Mutex<HashMap<String, DuplexStream>>>;

/// Create a connected listener/connector pair.
pub fn pair() -> (MemoryListener, MemoryConnector) {
    let (rendezvous_tx, rendezvous_rx) = mpsc::channel(1);
    let privates: PrivateRegistry = Arc::default();
    (
        MemoryListener {
            rendezvous_rx,
            privates: Arc::clone(&privates),
        },
        MemoryConnector {
            rendezvous_tx,
            privates,
            next_name: Arc::new(AtomicU64::new(1)),
        },
    )
}

/// Server side of the in-process transport.
#[derive(Debug)]
pub struct MemoryListener {
    rendezvous_rx: mpsc::Receiver<DuplexStream>,
    privates: PrivateRegistry,
}

impl MemoryListener {
    async fn accept_one(&mut self) -> Result<Channel> {
        let mut from_client = self
            .rendezvous_rx
            .recv()
            .await
            .ok_or(Error::TransportClosed)?;

        let privates = Arc::clone(&self.privates);
        let to_client = handshake::accept_with(&mut from_client, |name| async move {
            privates
                .lock()
                .await
                .remove(&name)
                .ok_or_else(|| Error::PrivatePath {
                    path: name.into(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                })
        })
        .await?;

        Ok(Channel::new(from_client, to_client))
    }
}

impl Listener for MemoryListener {
    fn accept(&mut self) -> impl Future<Output = Result<Channel>> + Send {
        self.accept_one()
    }
}

/// Client side of the in-process transport. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    rendezvous_tx: mpsc::Sender<DuplexStream>,
    privates: PrivateRegistry,
    next_name: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Join the listener, returning this client's channel to the server.
    pub async fn connect(&self) -> Result<Channel> {
        let name = format!("memory-{}", self.next_name.fetch_add(1, Ordering::Relaxed));

        let (mut from_server, server_private) = duplex(STREAM_CAPACITY);
        self.privates
            .lock()
            .await
            .insert(name.clone(), server_private);

        let (mut to_server, server_rendezvous) = duplex(STREAM_CAPACITY);
        if self.rendezvous_tx.send(server_rendezvous).await.is_err() {
            self.privates.lock().await.remove(&name);
            return Err(Error::TransportClosed);
        }
        debug!(name, "Opened in-process rendezvous");

        handshake::join_with(&mut to_server, &mut from_server, &name).await?;
        Ok(Channel::new(from_server, to_server))
    }
}

//! Transports that run the handshake and yield session channels.
//!
//! - [`fifo`]: named FIFOs on the filesystem, the canonical transport.
//! - [`memory`]: in-process duplex streams, for embedding and tests.

pub mod fifo;
pub mod memory;

use std::future::Future;

use crate::channel::Channel;
use crate::error::Result;

/// Server-side source of sessions.
///
/// Each call performs one complete handshake and returns the channel to the
/// newly joined client. Calls are never overlapped, which serializes
/// admission.
pub trait Listener: Send {
    fn accept(&mut self) -> impl Future<Output = Result<Channel>> + Send;
}

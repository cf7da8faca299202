//! mshell Core Library
//!
//! Shared functionality for mshell components:
//! - Byte-stream channels and close-once endpoints
//! - Reserved wire literals (ACK, PANIC) and typed chain frames
//! - The rendezvous handshake and the transports that run it
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod channel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod sentinel;
pub mod tracing_init;
pub mod transport;

pub use channel::{BoxReader, BoxWriter, Channel, Endpoint};
pub use config::Config;
pub use error::{Error, Result};
pub use sentinel::{ACK, Chunk, Frame, PANIC};
pub use transport::Listener;

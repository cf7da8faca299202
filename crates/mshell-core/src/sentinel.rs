//! Reserved wire literals and the typed frames used inside the server.
//!
//! The byte stream between a client and the server carries no framing. Two
//! literal values are reserved on it:
//!
//! - [`ACK`], exchanged twice during the handshake and purely advisory.
//! - [`PANIC`], the teardown request. A read is PANIC only when the whole
//!   chunk equals the literal; a longer or shorter read that merely contains
//!   it is ordinary payload.
//!
//! Inside the server every link between sessions carries [`Frame`]s, where
//! teardown is its own variant and can never be confused with payload.

use bytes::Bytes;

/// Handshake acknowledgement literal.
pub const ACK: &[u8; 4] = b"HOLA";

/// Teardown literal, NUL terminator included.
pub const PANIC: &[u8] = b"THE_PROGRAM_IS_ENDING_AND_YOU_NEED_TO_CLOSE\0";

/// Default chunk size for relay reads. Not protocol-significant.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;

/// Classification of one raw read from a wire endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk<'a> {
    /// The read returned zero bytes: the peer closed its end.
    Eof,
    /// The read returned exactly the [`PANIC`] literal.
    Panic,
    /// Anything else.
    Data(&'a [u8]),
}

/// Classify a chunk returned by a single read call.
pub fn classify(chunk: &[u8]) -> Chunk<'_> {
    if chunk.is_empty() {
        Chunk::Eof
    } else if chunk == PANIC {
        Chunk::Panic
    } else {
        Chunk::Data(chunk)
    }
}

/// Classify a chunk with PANIC detection switched off.
///
/// Used when the wire is configured to signal teardown out-of-band only
/// (by closing the stream), which makes payload immune to collisions.
pub fn classify_payload_only(chunk: &[u8]) -> Chunk<'_> {
    if chunk.is_empty() {
        Chunk::Eof
    } else {
        Chunk::Data(chunk)
    }
}

/// A message on an in-process link of the session chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Raw payload bytes.
    Data(Bytes),
    /// Teardown request.
    Panic,
}

impl Frame {
    /// Build a data frame by copying `bytes`.
    pub fn data(bytes: &[u8]) -> Self {
        Self::Data(Bytes::copy_from_slice(bytes))
    }
}

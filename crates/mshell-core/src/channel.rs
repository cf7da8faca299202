//! Byte-stream channels and close-once endpoints.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Boxed read half of a channel.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of a channel.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A bidirectional byte stream built from two unidirectional halves.
///
/// Write-call boundaries are not preserved in transit.
pub struct Channel {
    /// Bytes arriving from the peer.
    pub reader: BoxReader,
    /// Bytes sent to the peer.
    pub writer: BoxWriter,
}

impl Channel {
    /// Build a channel from any pair of async halves.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Split into two named, close-once endpoints.
    pub fn into_endpoints(
        self,
        reader_name: &'static str,
        writer_name: &'static str,
    ) -> (Endpoint<BoxReader>, Endpoint<BoxWriter>) {
        (
            Endpoint::new(reader_name, self.reader),
            Endpoint::new(writer_name, self.writer),
        )
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

/// One owned half of a link that is closed at most once.
///
/// `close` hands the inner value back the first time and `None` on every
/// later call, so teardown code can run unconditionally.
pub struct Endpoint<T> {
    name: &'static str,
    inner: Option<T>,
}

impl<T> Endpoint<T> {
    /// Wrap an open endpoint.
    pub const fn new(name: &'static str, inner: T) -> Self {
        Self {
            name,
            inner: Some(inner),
        }
    }

    /// An endpoint that starts out closed.
    pub const fn closed(name: &'static str) -> Self {
        Self { name, inner: None }
    }

    /// Diagnostic name.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    pub const fn get(&self) -> Option<&T> {
        self.inner.as_ref()
    }

    pub const fn get_mut(&mut self) -> Option<&mut T> {
        self.inner.as_mut()
    }

    /// Close the endpoint, returning the inner value if it was still open.
    pub fn close(&mut self) -> Option<T> {
        let inner = self.inner.take();
        if inner.is_some() {
            trace!(endpoint = self.name, "Closing endpoint");
        } else {
            trace!(endpoint = self.name, "Endpoint already closed");
        }
        inner
    }
}

impl<W: AsyncWrite + Unpin> Endpoint<W> {
    /// Flush and shut down a writer endpoint, then close it.
    ///
    /// Returns `true` if this call performed the close.
    pub async fn shutdown(&mut self) -> bool {
        let Some(mut writer) = self.close() else {
            return false;
        };
        if let Err(e) = writer.shutdown().await {
            debug!(endpoint = self.name, error = %e, "Shutdown of writer failed");
        }
        true
    }
}

impl<T> fmt::Debug for Endpoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

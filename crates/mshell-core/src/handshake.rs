//! Handshake choreography shared by every transport.
//!
//! ```text
//! server                                   client
//!   create rendezvous, wait for a writer
//!                                          open rendezvous for writing
//!                                          create + pre-open private path
//!                  <── private name ─────  (rendezvous stream)
//!   remove rendezvous, open private path
//!                  ── ACK ─────────────>   (private stream)
//!                  <── ACK ─────────────   (rendezvous stream)
//! ```
//!
//! The rendezvous stream stays open afterwards and becomes the
//! client-to-server half of the session channel; the private stream becomes
//! the server-to-client half. A short or garbled ACK is logged and ignored.

use std::fmt;
use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sentinel::ACK;

/// Size of the fixed, NUL-padded record that carries the private name.
pub const NAME_RECORD_LEN: usize = 256;

/// Which side of the handshake is logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// Outcome of waiting for the peer's ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckStatus {
    Valid,
    /// Whatever arrived instead, possibly nothing.
    Garbled(Vec<u8>),
}

/// Write the private name as one fixed-size record.
pub async fn send_private_name<W>(writer: &mut W, name: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= NAME_RECORD_LEN || bytes.contains(&0) {
        return Err(Error::Handshake(format!(
            "private name must be 1..{NAME_RECORD_LEN} bytes without NUL, got {} bytes",
            bytes.len()
        )));
    }

    let mut record = [0u8; NAME_RECORD_LEN];
    record[..bytes.len()].copy_from_slice(bytes);
    writer.write_all(&record).await?;
    writer.flush().await?;
    debug!(name, "Sent private name");
    Ok(())
}

/// Read one private-name record.
pub async fn read_private_name<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut record = [0u8; NAME_RECORD_LEN];
    reader.read_exact(&mut record).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Handshake("rendezvous closed before a private name arrived".into())
        } else {
            Error::Io(e)
        }
    })?;

    let end = record
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(NAME_RECORD_LEN);
    let name = std::str::from_utf8(&record[..end])
        .map_err(|_| Error::Handshake("private name is not valid UTF-8".into()))?;
    if name.is_empty() {
        return Err(Error::Handshake("private name is empty".into()));
    }
    debug!(name, "Received private name");
    Ok(name.to_owned())
}

/// Write the ACK literal.
pub async fn send_ack<W>(writer: &mut W, role: Role) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(ACK).await?;
    writer.flush().await?;
    debug!(%role, "Sent ACK");
    Ok(())
}

/// Wait for the peer's ACK.
///
/// Performs a single read of at most `ACK.len()` bytes, so payload that
/// follows the ACK stays in the stream. Never fails.
pub async fn recv_ack<R>(reader: &mut R, role: Role) -> AckStatus
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; ACK.len()];
    match reader.read(&mut buf).await {
        Ok(n) if buf[..n] == ACK[..] => {
            debug!(%role, "Received ACK");
            AckStatus::Valid
        }
        Ok(n) => {
            warn!(
                %role,
                received = %String::from_utf8_lossy(&buf[..n]),
                "Error receiving ACK, continuing anyway"
            );
            AckStatus::Garbled(buf[..n].to_vec())
        }
        Err(e) => {
            warn!(%role, error = %e, "Error receiving ACK, continuing anyway");
            AckStatus::Garbled(Vec::new())
        }
    }
}

/// Server steps 3 and 5, run once a client has opened the rendezvous.
///
/// `open_private` receives the client's private name. It is the place to
/// remove the rendezvous path and must return the server's send half.
pub async fn accept_with<R, W, F, Fut>(from_client: &mut R, open_private: F) -> Result<W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<W>>,
{
    let name = read_private_name(from_client).await?;
    let mut to_client = open_private(name).await?;
    send_ack(&mut to_client, Role::Server).await?;
    recv_ack(from_client, Role::Server).await;
    Ok(to_client)
}

/// Client steps 2 and 4, run with the rendezvous open for writing and the
/// private path already open for reading.
pub async fn join_with<R, W>(to_server: &mut W, from_server: &mut R, name: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_private_name(to_server, name).await?;
    recv_ack(from_server, Role::Client).await;
    send_ack(to_server, Role::Client).await
}

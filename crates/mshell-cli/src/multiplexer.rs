//! Client-side multiplexer.
//!
//! Copies the local terminal's input to the server and the server's output to
//! the local terminal until one side ends or the user interrupts.

use std::future::Future;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use mshell_core::sentinel::DEFAULT_BUFFER_SIZE;
use mshell_core::{Channel, PANIC};

/// Multiplexer configuration.
#[derive(Debug, Clone, Copy)]
pub struct MultiplexerOptions {
    /// Size of each read from either side.
    pub buffer_size: usize,
    /// Send the PANIC literal to the server before leaving on an interrupt.
    pub panic_on_interrupt: bool,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            panic_on_interrupt: true,
        }
    }
}

/// How the client session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Local input reached end-of-file.
    LocalClosed,
    /// The server closed this client's channel.
    ServerClosed,
    /// The interrupt future fired.
    Interrupted,
}

/// Relay between the local terminal and the server until one side ends.
pub async fn run_multiplexer<I, O, F>(
    mut local_in: I,
    mut local_out: O,
    channel: Channel,
    interrupt: F,
    options: MultiplexerOptions,
) -> Result<Termination, MultiplexerError>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let (mut from_server, mut to_server) = channel.into_endpoints("server-in", "server-out");
    let mut local_buf = vec![0u8; options.buffer_size.max(1)];
    let mut server_buf = vec![0u8; options.buffer_size.max(1)];
    tokio::pin!(interrupt);

    let outcome = loop {
        let (Some(reader), Some(writer)) = (from_server.get_mut(), to_server.get_mut()) else {
            break Ok(Termination::ServerClosed);
        };
        tokio::select! {
            biased;
            () = &mut interrupt => {
                if options.panic_on_interrupt {
                    match writer.write_all(PANIC).await {
                        Ok(()) => debug!("Sent PANIC to server"),
                        Err(e) => debug!(error = %e, "Server gone before PANIC"),
                    }
                }
                info!("Interrupted");
                break Ok(Termination::Interrupted);
            }
            read = reader.read(&mut server_buf) => match read {
                Ok(0) => {
                    info!("Server closed the session");
                    break Ok(Termination::ServerClosed);
                }
                Ok(n) => {
                    if let Err(e) = write_flush(&mut local_out, &server_buf[..n]).await {
                        break Err(MultiplexerError::LocalOutput(e));
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Server read failed");
                    break Ok(Termination::ServerClosed);
                }
            },
            read = local_in.read(&mut local_buf) => match read {
                Ok(0) => {
                    info!("Local input closed");
                    break Ok(Termination::LocalClosed);
                }
                Ok(n) => {
                    if let Err(e) = write_flush(writer, &local_buf[..n]).await {
                        debug!(error = %e, "Server write failed");
                        break Ok(Termination::ServerClosed);
                    }
                }
                Err(e) => break Err(MultiplexerError::LocalInput(e)),
            },
        }
    };

    to_server.shutdown().await;
    from_server.close();
    outcome
}

async fn write_flush<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Errors on the local side of the multiplexer.
#[derive(Debug, thiserror::Error)]
pub enum MultiplexerError {
    #[error("Failed to read local input: {0}")]
    LocalInput(#[source] std::io::Error),

    #[error("Failed to write local output: {0}")]
    LocalOutput(#[source] std::io::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use tokio::io::{DuplexStream, duplex};
    use tokio::sync::oneshot;

    use super::*;

    struct Server {
        reader: tokio::io::ReadHalf<DuplexStream>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    fn channel() -> (Channel, Server) {
        let (client_side, server_side) = duplex(4096);
        let (reader, writer) = tokio::io::split(client_side);
        let (server_reader, server_writer) = tokio::io::split(server_side);
        (
            Channel::new(reader, writer),
            Server {
                reader: server_reader,
                writer: server_writer,
            },
        )
    }

    fn never() -> std::future::Pending<()> {
        std::future::pending()
    }

    #[tokio::test]
    async fn server_output_reaches_local_output() {
        let (channel, mut server) = channel();
        let (local_in, _keep_open) = duplex(64);
        let (local_out, mut screen) = duplex(64);

        let run = tokio::spawn(run_multiplexer(
            local_in,
            local_out,
            channel,
            never(),
            MultiplexerOptions::default(),
        ));
        server.writer.write_all(b"hi\n").await.unwrap();
        let mut buf = [0u8; 3];
        screen.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi\n");

        drop(server);
        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, Termination::ServerClosed);
    }

    #[tokio::test]
    async fn local_input_reaches_server_and_eof_ends_session() {
        let (channel, mut server) = channel();
        let (local_in, mut keyboard) = duplex(64);
        let (local_out, _screen) = duplex(64);

        let run = tokio::spawn(run_multiplexer(
            local_in,
            local_out,
            channel,
            never(),
            MultiplexerOptions::default(),
        ));
        keyboard.write_all(b"ls\n").await.unwrap();
        let mut buf = [0u8; 3];
        server.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\n");

        drop(keyboard);
        assert_eq!(run.await.unwrap().unwrap(), Termination::LocalClosed);

        // The server sees this client's channel end.
        let mut rest = Vec::new();
        server.reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn interrupt_sends_panic_literal() {
        let (channel, mut server) = channel();
        let (local_in, _keyboard) = duplex(64);
        let (local_out, _screen) = duplex(64);
        let (fire, fired) = oneshot::channel::<()>();

        let run = tokio::spawn(run_multiplexer(
            local_in,
            local_out,
            channel,
            async {
                fired.await.ok();
            },
            MultiplexerOptions::default(),
        ));
        fire.send(()).unwrap();
        assert_eq!(run.await.unwrap().unwrap(), Termination::Interrupted);

        let mut received = Vec::new();
        server.reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, PANIC);
    }

    #[tokio::test]
    async fn interrupt_without_panic_just_closes() {
        let (channel, mut server) = channel();
        let (local_in, _keyboard) = duplex(64);
        let (local_out, _screen) = duplex(64);

        let options = MultiplexerOptions {
            panic_on_interrupt: false,
            ..MultiplexerOptions::default()
        };
        let outcome = run_multiplexer(local_in, local_out, channel, async {}, options)
            .await
            .unwrap();
        assert_eq!(outcome, Termination::Interrupted);

        let mut received = Vec::new();
        server.reader.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn server_closing_while_idle_ends_promptly() {
        let (channel, server) = channel();
        let (local_in, _keyboard) = duplex(64);
        let (local_out, _screen) = duplex(64);
        drop(server);

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            run_multiplexer(local_in, local_out, channel, never(), MultiplexerOptions::default()),
        )
        .await
        .expect("multiplexer did not notice the server closing")
        .unwrap();
        assert_eq!(outcome, Termination::ServerClosed);
    }
}

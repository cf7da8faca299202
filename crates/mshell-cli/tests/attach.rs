//! The client multiplexer against a running server.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
use tokio::sync::oneshot;

use mshell_cli::{MultiplexerOptions, Termination, run_multiplexer};
use mshell_core::transport::fifo::{self, DEFAULT_RENDEZVOUS, FifoListener};
use mshell_core::transport::memory;
use mshell_core::{Channel, Error, Frame};
use mshell_daemon::{CloseReason, InterpreterLink, Server, ServerConfig, ShutdownCause};

const WAIT: Duration = Duration::from_secs(10);

async fn connect_fifo(rendezvous: &Path, private_dir: &Path) -> Channel {
    for _ in 0..400 {
        match fifo::connect(rendezvous, private_dir).await {
            Ok(channel) => return channel,
            Err(Error::Rendezvous { .. }) => tokio::time::sleep(Duration::from_millis(5)).await,
            Err(e) => panic!("connect failed: {e}"),
        }
    }
    panic!("server never opened {}", rendezvous.display());
}

#[tokio::test]
async fn interrupt_tears_down_the_server() {
    let (listener, connector) = memory::pair();
    let (link, mut interpreter_in, interpreter_out) = InterpreterLink::detached();
    let server = tokio::spawn(
        Server::new(listener, ServerConfig::default()).run(link, std::future::pending()),
    );

    let channel = connector.connect().await.unwrap();
    let (local_in, mut keyboard) = duplex(256);
    let (local_out, mut screen) = duplex(256);
    let (fire, fired) = oneshot::channel::<()>();
    let client = tokio::spawn(run_multiplexer(
        local_in,
        local_out,
        channel,
        async {
            fired.await.ok();
        },
        MultiplexerOptions::default(),
    ));

    keyboard.write_all(b"echo hi\n").await.unwrap();
    assert_eq!(&interpreter_in.recv().await.unwrap()[..], b"echo hi\n");
    interpreter_out.send(Frame::data(b"hi\n")).await.unwrap();
    let mut buf = [0u8; 3];
    screen.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi\n");

    fire.send(()).unwrap();
    assert_eq!(client.await.unwrap().unwrap(), Termination::Interrupted);

    let report = tokio::time::timeout(WAIT, server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(report.cause, ShutdownCause::RootClosed(CloseReason::ClientPanic));
}

#[tokio::test]
async fn quiet_interrupt_is_an_ordinary_hangup() {
    let (listener, connector) = memory::pair();
    let (link, _interpreter_in, _interpreter_out) = InterpreterLink::detached();
    let server = tokio::spawn(
        Server::new(listener, ServerConfig::default()).run(link, std::future::pending()),
    );

    let channel = connector.connect().await.unwrap();
    let (local_in, _keyboard) = duplex(256);
    let (local_out, _screen) = duplex(256);
    let options = MultiplexerOptions {
        panic_on_interrupt: false,
        ..MultiplexerOptions::default()
    };
    let termination = run_multiplexer(local_in, local_out, channel, async {}, options)
        .await
        .unwrap();
    assert_eq!(termination, Termination::Interrupted);

    let report = tokio::time::timeout(WAIT, server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(report.cause, ShutdownCause::RootClosed(CloseReason::ClientClosed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_client_is_told_when_the_server_goes_away() {
    let dir = tempfile::TempDir::new().unwrap();
    let rendezvous = dir.path().join(DEFAULT_RENDEZVOUS);
    let (link, mut interpreter_in, _interpreter_out) = InterpreterLink::detached();
    let server = tokio::spawn(
        Server::new(FifoListener::bind(&rendezvous), ServerConfig::default())
            .run(link, std::future::pending()),
    );

    let mut root = connect_fifo(&rendezvous, dir.path()).await;
    root.writer.write_all(b"root\n").await.unwrap();
    assert_eq!(&interpreter_in.recv().await.unwrap()[..], b"root\n");

    let late_dir = dir.path().join("late");
    std::fs::create_dir(&late_dir).unwrap();
    let channel = connect_fifo(&rendezvous, &late_dir).await;
    let (local_in, mut keyboard) = duplex(256);
    let (local_out, _screen) = duplex(256);
    let client = tokio::spawn(run_multiplexer(
        local_in,
        local_out,
        channel,
        std::future::pending(),
        MultiplexerOptions::default(),
    ));
    keyboard.write_all(b"late\n").await.unwrap();
    assert_eq!(&interpreter_in.recv().await.unwrap()[..], b"late\n");

    drop(root);
    let termination = tokio::time::timeout(WAIT, client)
        .await
        .expect("client did not notice the server closing")
        .unwrap()
        .unwrap();
    assert_eq!(termination, Termination::ServerClosed);

    let report = tokio::time::timeout(WAIT, server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(report.cause, ShutdownCause::RootClosed(CloseReason::ClientClosed));
}

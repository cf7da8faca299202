//! Named-FIFO transport.
//!
//! The server owns one well-known rendezvous FIFO, created fresh for every
//! handshake and unlinked as soon as a client's private name has been read.
//! Each client owns one private FIFO named after its process id.

use std::fs::File;
use std::future::Future;
use std::os::fd::AsFd;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::net::unix::pipe;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::handshake;
use crate::transport::Listener;

/// Default name of the rendezvous FIFO, relative to the working directory.
pub const DEFAULT_RENDEZVOUS: &str = "multi_shell_pipe";

const FIFO_MODE: u32 = 0o666;

/// Server side of the FIFO transport.
#[derive(Debug)]
pub struct FifoListener {
    path: PathBuf,
}

impl FifoListener {
    /// Use `path` as the rendezvous FIFO. Nothing is created until `accept`.
    pub fn bind(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the rendezvous FIFO if one is currently on disk.
    pub fn cleanup(&self) {
        remove_if_present(&self.path);
    }

    async fn accept_one(&self) -> Result<Channel> {
        remove_if_present(&self.path);
        create_fifo(&self.path).map_err(|source| Error::Rendezvous {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), "Created rendezvous FIFO");

        let mut from_client = pipe::OpenOptions::new()
            .open_receiver(&self.path)
            .map_err(|source| Error::Rendezvous {
                path: self.path.clone(),
                source,
            })?;
        debug!("Waiting for a client on the rendezvous FIFO");

        // The receiver only turns readable once a writer has delivered data.
        from_client
            .readable()
            .await
            .map_err(|source| Error::Rendezvous {
                path: self.path.clone(),
                source,
            })?;

        let rendezvous = self.path.clone();
        let result = handshake::accept_with(&mut from_client, |name| async move {
            remove_if_present(&rendezvous);
            let private = PathBuf::from(name);
            let to_client = pipe::OpenOptions::new()
                .open_sender(&private)
                .map_err(|source| Error::PrivatePath {
                    path: private.clone(),
                    source,
                })?;
            info!(path = %private.display(), "Opened private FIFO");
            Ok(to_client)
        })
        .await;

        match result {
            Ok(to_client) => Ok(Channel::new(from_client, to_client)),
            Err(e) => {
                self.cleanup();
                Err(e)
            }
        }
    }
}

impl Drop for FifoListener {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl Listener for FifoListener {
    fn accept(&mut self) -> impl Future<Output = Result<Channel>> + Send {
        self.accept_one()
    }
}

/// Path of the private FIFO for the process `pid`.
pub fn private_fifo_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("mshell-{pid}.fifo"))
}

/// Client side of the FIFO transport.
///
/// Fails immediately when no server is waiting on `rendezvous`; there is no
/// retry.
pub async fn connect(rendezvous: &Path, private_dir: &Path) -> Result<Channel> {
    let to_server = open_rendezvous(rendezvous)?;
    join_over(to_server, rendezvous, private_dir).await
}

fn open_rendezvous(rendezvous: &Path) -> Result<pipe::Sender> {
    let to_server = pipe::OpenOptions::new()
        .open_sender(rendezvous)
        .map_err(|source| Error::Rendezvous {
            path: rendezvous.to_path_buf(),
            source,
        })?;
    info!(path = %rendezvous.display(), "Opened rendezvous FIFO");
    Ok(to_server)
}

async fn join_over(
    mut to_server: pipe::Sender,
    rendezvous: &Path,
    private_dir: &Path,
) -> Result<Channel> {
    let dir = std::path::absolute(private_dir).map_err(|source| Error::PrivatePath {
        path: private_dir.to_path_buf(),
        source,
    })?;
    let private = PrivateFifo::create(private_fifo_path(&dir, std::process::id()))?;

    let mut from_server = pipe::OpenOptions::new()
        .open_receiver(private.path())
        .map_err(|source| Error::PrivatePath {
            path: private.path().to_path_buf(),
            source,
        })?;

    let name = private
        .path()
        .to_str()
        .ok_or_else(|| Error::Handshake("private path is not valid UTF-8".into()))?
        .to_owned();

    // Checked right before the name is written: once another client's name
    // has been read the server unlinks the rendezvous, and anything written
    // to it afterwards lands in that client's session.
    ensure_unclaimed(&to_server, rendezvous)?;
    handshake::join_with(&mut to_server, &mut from_server, &name).await?;

    // The server holds the FIFO open now; the name is no longer needed.
    drop(private);
    Ok(Channel::new(from_server, to_server))
}

/// Fail unless the opened rendezvous is still the FIFO linked at `path`.
fn ensure_unclaimed(to_server: &pipe::Sender, path: &Path) -> Result<()> {
    let rendezvous_error = |source| Error::Rendezvous {
        path: path.to_path_buf(),
        source,
    };
    let opened = to_server
        .as_fd()
        .try_clone_to_owned()
        .map(File::from)
        .and_then(|file| file.metadata())
        .map_err(rendezvous_error)?;
    let linked = match std::fs::metadata(path) {
        Ok(on_disk) => {
            opened.nlink() > 0 && opened.dev() == on_disk.dev() && opened.ino() == on_disk.ino()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => return Err(rendezvous_error(e)),
    };
    if linked {
        return Ok(());
    }
    warn!(path = %path.display(), "Rendezvous was claimed by another client");
    Err(rendezvous_error(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "rendezvous already claimed by another client",
    )))
}

/// A private FIFO on disk, unlinked when dropped.
struct PrivateFifo {
    path: PathBuf,
}

impl PrivateFifo {
    fn create(path: PathBuf) -> Result<Self> {
        remove_if_present(&path);
        create_fifo(&path).map_err(|source| Error::PrivatePath {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "Created private FIFO");
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PrivateFifo {
    fn drop(&mut self) {
        remove_if_present(&self.path);
    }
}

fn create_fifo(path: &Path) -> std::io::Result<()> {
    mkfifo(path, Mode::from_bits_truncate(FIFO_MODE)).map_err(std::io::Error::from)
}

fn remove_if_present(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed FIFO"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove FIFO"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::os::unix::fs::FileTypeExt;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn private_path_is_derived_from_pid() {
        let path = private_fifo_path(Path::new("/run/x"), 1234);
        assert_eq!(path, PathBuf::from("/run/x/mshell-1234.fifo"));
    }

    #[tokio::test]
    async fn connect_without_server_fails_fast() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = connect(&dir.path().join("missing"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rendezvous { .. }));
    }

    #[tokio::test]
    async fn private_fifo_is_removed_on_drop() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("p.fifo");
        let fifo = PrivateFifo::create(path.clone()).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_fifo());
        drop(fifo);
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handshake_over_fifos() {
        let dir = tempfile::TempDir::new().unwrap();
        let rendezvous = dir.path().join(DEFAULT_RENDEZVOUS);
        let mut listener = FifoListener::bind(&rendezvous);

        let server = tokio::spawn(async move {
            let mut channel = listener.accept().await.unwrap();
            channel.writer.write_all(b"from server").await.unwrap();
            let mut buf = [0u8; 11];
            channel.reader.read_exact(&mut buf).await.unwrap();
            (listener, buf)
        });

        // The server may not have opened the rendezvous yet.
        let mut attempts = 0;
        let mut client = loop {
            match connect(&rendezvous, dir.path()).await {
                Ok(channel) => break channel,
                Err(Error::Rendezvous { .. }) if attempts < 200 => {
                    attempts += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
                Err(e) => panic!("connect failed: {e}"),
            }
        };
        client.writer.write_all(b"from client").await.unwrap();

        let mut buf = [0u8; 11];
        client.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"from server");

        let (listener, received) = server.await.unwrap();
        assert_eq!(&received, b"from client");
        assert!(!listener.path().exists(), "rendezvous must be unlinked");
        assert!(
            !private_fifo_path(dir.path(), std::process::id()).exists(),
            "private FIFO must be unlinked"
        );
    }

    #[tokio::test]
    async fn dropping_a_waiting_listener_removes_rendezvous() {
        let dir = tempfile::TempDir::new().unwrap();
        let rendezvous = dir.path().join(DEFAULT_RENDEZVOUS);
        let mut listener = FifoListener::bind(&rendezvous);
        let waiting = tokio::spawn(async move { listener.accept().await.map(drop) });

        for _ in 0..200 {
            if rendezvous.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(rendezvous.exists());

        waiting.abort();
        assert!(waiting.await.unwrap_err().is_cancelled());
        assert!(!rendezvous.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_holding_a_claimed_rendezvous_backs_off() {
        let dir = tempfile::TempDir::new().unwrap();
        let rendezvous = dir.path().join(DEFAULT_RENDEZVOUS);
        let mut listener = FifoListener::bind(&rendezvous);
        let server = tokio::spawn(async move {
            let mut channel = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            channel.reader.read_exact(&mut buf).await.unwrap();
            buf
        });

        // This client opens the rendezvous first but is slow to send its name.
        let mut attempts = 0;
        let slow = loop {
            match open_rendezvous(&rendezvous) {
                Ok(sender) => break sender,
                Err(Error::Rendezvous { .. }) if attempts < 200 => {
                    attempts += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
                Err(e) => panic!("open failed: {e}"),
            }
        };

        let fast_dir = dir.path().join("fast");
        let slow_dir = dir.path().join("slow");
        std::fs::create_dir(&fast_dir).unwrap();
        std::fs::create_dir(&slow_dir).unwrap();
        let mut fast = connect(&rendezvous, &fast_dir).await.unwrap();

        let err = join_over(slow, &rendezvous, &slow_dir).await.unwrap_err();
        assert!(matches!(err, Error::Rendezvous { .. }));
        assert!(!private_fifo_path(&slow_dir, std::process::id()).exists());

        // The winner's session carries only its own bytes.
        fast.writer.write_all(b"hello").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"hello");
    }
}

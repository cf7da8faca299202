//! mshell Daemon
//!
//! Spawns the shared interpreter, listens on the rendezvous FIFO and relays
//! between the interpreter and every joined client until the first client
//! leaves.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{Instrument, info, info_span};

use mshell_core::config::{DaemonConfig, load_config, load_config_file};
use mshell_core::tracing_init::{default_filter, init_tracing};
use mshell_core::transport::fifo::FifoListener;
use mshell_daemon::{InterpreterHost, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "mshell-daemon")]
#[command(version, about = "mshell daemon - one shell shared by many terminals")]
struct Args {
    /// Rendezvous FIFO path
    #[arg(long)]
    rendezvous: Option<PathBuf>,

    /// Interpreter to spawn
    #[arg(long)]
    shell: Option<String>,

    /// Arguments passed to the interpreter
    #[arg(last = true)]
    shell_args: Vec<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Relay buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Relay the PANIC literal from clients as ordinary input
    #[arg(long)]
    no_wire_panic: bool,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "MSHELL_LOG_JSON")]
    log_json: bool,

    /// Read settings from this file instead of the usual locations
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(path) = &self.rendezvous {
            config.rendezvous_path.clone_from(path);
        }
        if let Some(shell) = &self.shell {
            config.interpreter.program.clone_from(shell);
            config.interpreter.args.clone_from(&self.shell_args);
        } else if !self.shell_args.is_empty() {
            config.interpreter.args.clone_from(&self.shell_args);
        }
        if let Some(max) = self.max_sessions {
            config.max_sessions = Some(max);
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if self.no_wire_panic {
            config.detect_wire_panic = false;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config_file(path)?,
        None => load_config(std::env::current_dir().ok().as_deref())?,
    };
    args.apply(&mut config.daemon);
    config.validate()?;
    let daemon = config.daemon;

    init_tracing(
        &default_filter(&["mshell_daemon", "mshell_core"], &daemon.log_level),
        args.log_json,
    );

    serve(daemon).instrument(info_span!("server")).await
}

async fn serve(daemon: DaemonConfig) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        rendezvous = %daemon.rendezvous_path.display(),
        interpreter = %daemon.interpreter.program,
        max_sessions = ?daemon.max_sessions,
        "Starting mshell-daemon"
    );

    let (mut host, link) = InterpreterHost::spawn(
        &daemon.interpreter,
        daemon.buffer_size,
        Duration::from_secs(daemon.terminate_timeout_secs),
    )?;
    let listener = FifoListener::bind(&daemon.rendezvous_path);
    let server = Server::new(listener, ServerConfig::from(&daemon));

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let result = server
        .run(link, async {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C shutdown signal");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM shutdown signal");
                }
                status = host.wait() => {
                    info!(?status, "Interpreter exited");
                }
            }
        })
        .await;

    host.terminate().await?;
    let report = result.context("server stopped on a fatal error")?;

    info!(
        cause = ?report.cause,
        admitted = report.stats.admitted,
        rejected = report.stats.rejected,
        "Daemon stopped"
    );
    Ok(())
}

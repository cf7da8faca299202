//! mshell CLI
//!
//! Joins the shared shell through the rendezvous FIFO and relays the local
//! terminal to it.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{Instrument, error, info, info_span, warn};

use mshell_cli::{MultiplexerOptions, run_multiplexer};
use mshell_core::config::{ClientConfig, load_config, load_config_file};
use mshell_core::tracing_init::{default_filter, init_tracing};
use mshell_core::transport::fifo;

#[derive(Parser, Debug)]
#[command(name = "mshell")]
#[command(version, about = "Join a shell shared through mshell-daemon", long_about = None)]
struct Cli {
    /// Rendezvous FIFO path
    #[arg(long)]
    rendezvous: Option<PathBuf>,

    /// Directory for this client's private FIFO
    #[arg(long)]
    private_dir: Option<PathBuf>,

    /// Leave on Ctrl+C without asking the server to tear down
    #[arg(long)]
    no_panic: bool,

    /// Relay buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Log level filter (e.g. "warn", "info", "debug")
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "MSHELL_LOG_JSON")]
    log_json: bool,

    /// Read settings from this file instead of the usual locations
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(path) = &self.rendezvous {
            config.rendezvous_path.clone_from(path);
        }
        if let Some(dir) = &self.private_dir {
            config.private_dir.clone_from(dir);
        }
        if self.no_panic {
            config.panic_on_interrupt = false;
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => load_config(std::env::current_dir().ok().as_deref())?,
    };
    cli.apply(&mut config.client);
    config.validate()?;
    let client = config.client;

    init_tracing(
        &default_filter(&["mshell", "mshell_cli", "mshell_core"], &client.log_level),
        cli.log_json,
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    let result = runtime.block_on(attach(client).instrument(info_span!("client")));
    // Stdin is read on a blocking thread that cannot be cancelled.
    runtime.shutdown_background();
    result
}

async fn attach(client: ClientConfig) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        rendezvous = %client.rendezvous_path.display(),
        "Joining shared shell"
    );

    let channel = match fifo::connect(&client.rendezvous_path, &client.private_dir).await {
        Ok(channel) => channel,
        Err(e) => {
            error!(error = %e, "Handshake failed");
            return Err(e).context("could not join the shared shell");
        }
    };

    let options = MultiplexerOptions {
        buffer_size: client.buffer_size,
        panic_on_interrupt: client.panic_on_interrupt,
    };
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    let termination = run_multiplexer(
        tokio::io::stdin(),
        tokio::io::stdout(),
        channel,
        interrupt,
        options,
    )
    .await?;
    info!(?termination, "Left shared shell");
    Ok(())
}

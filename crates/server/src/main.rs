use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info, info_span};
use tracing_subscriber::EnvFilter;

mod config;
mod control;
mod file_server;
mod range;
mod serve;
mod session;
mod viewer;

use config::load_settings;
use session::{SessionCoordinator, SessionRequest};
use viewer::{NoLaunch, SystemBrowser, ViewerLauncher};

#[derive(Debug, Parser)]
#[command(
    name = "parquet-bridge",
    version,
    about = "Open local parquet files and SQL queries in the parquet viewer"
)]
struct Cli {
    /// Log at debug level instead of warnings only
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Print the viewer URL without opening a browser
    #[arg(long, global = true)]
    no_open: bool,
    /// Give up on the viewer's acknowledgment after this many seconds (0 waits forever)
    #[arg(long, global = true)]
    ack_timeout_secs: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Hand a SQL query to the viewer
    Sql { query: String },
    /// Serve a local parquet file to the viewer
    File {
        path: PathBuf,
        /// Port for the file server; picked by the OS when omitted
        #[arg(short, long)]
        port: Option<u16>,
    },
}

impl Command {
    fn into_request(self) -> (SessionRequest, Option<u16>) {
        match self {
            Command::Sql { query } => (
                SessionRequest {
                    query: Some(query),
                    file: None,
                },
                None,
            ),
            Command::File { path, port } => (
                SessionRequest {
                    query: None,
                    file: Some(path),
                },
                port,
            ),
        }
    }
}

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("warn,parquet_bridge=debug,tower_http=debug")
        } else {
            EnvFilter::new("warn")
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(cli.verbose))
        .init();

    let settings = load_settings();
    let (request, data_port) = cli.command.into_request();
    let config = settings.session_config(request, data_port, cli.ack_timeout_secs)?;

    let launcher: Arc<dyn ViewerLauncher> = if cli.no_open {
        Arc::new(NoLaunch)
    } else {
        Arc::new(SystemBrowser)
    };
    let mut coordinator = SessionCoordinator::new(config, launcher, info_span!("session"))?;
    let addresses = coordinator
        .start()
        .await
        .context("failed to start viewer session")?;
    if let Some(data) = &addresses.data {
        info!(%data, "serving file");
    }
    info!(control = %addresses.control, "waiting for the viewer to connect");
    println!("Open the viewer at:\n{}", addresses.viewer_url);

    tokio::select! {
        report = coordinator.wait() => {
            let report = report?;
            info!(%report, "session complete");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("stopped by user");
        }
    }
    debug!(state = ?coordinator.state(), "exiting");
    Ok(())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

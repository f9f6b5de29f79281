//! ev-remapperd - input remapping daemon for Linux.
//!
//! Runs as the D-Bus service by default. The hidden `injector` subcommand
//! is the entry point of the per-device-group child processes the daemon
//! spawns for itself.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ev_remapper::{injector, logger, service};
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser)]
#[command(name = "ev-remapperd", version, about = "Input event code remapping daemon")]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Config directory to load at startup
    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Probe a running service over the bus
    Ping,

    /// Injection child entry point, spawned by the daemon
    #[command(hide = true)]
    Injector {
        /// JSON spawn payload (device group + mapping snapshot)
        payload: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    // Only the daemon trims the shared log file; its children just append.
    logger::init(cli.debug, cli.command.is_none());

    let result = match cli.command {
        Some(Command::Injector { payload }) => injector::run_child(&payload).map(|()| 0),
        Some(Command::Ping) => block_on(service::ping()),
        None => block_on(service::run(cli.config_dir)),
    };

    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn block_on(future: impl Future<Output = Result<i32>>) -> Result<i32> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(future)
}

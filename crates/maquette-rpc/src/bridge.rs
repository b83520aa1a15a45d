//! Maquette Bridge CLI - the host add-in side of the lifecycle.
//!
//! Thin mapping onto the lifecycle manager: `start` is start-or-attach,
//! `stop` is the owner-checked graceful path, `force-stop` is the explicit,
//! separately confirmed escalation, and `status` reads the lock record and
//! probes health.

use anyhow::Result;
use clap::{Parser, Subcommand};
use maquette_core::{BridgeError, BridgeSettings, LifecycleManager, PortLocker};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "maquette-bridge")]
#[command(about = "Start, attach to, and stop the Maquette RPC server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Target port (defaults to the settings file's preferred port)
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (missing file = defaults)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ensure a server is running, attaching to a healthy one if present
    Start,
    /// Gracefully stop the server on the target port (owner check applies)
    Stop,
    /// Terminate the recorded server process regardless of ownership
    ForceStop,
    /// Report reachability and the lock record for the target port
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let settings_path = cli
        .settings
        .unwrap_or_else(|| BridgeSettings::data_dir().join("settings.json"));
    let settings = BridgeSettings::load(&settings_path);
    let port = cli.port.unwrap_or(settings.preferred_port);

    let locker = PortLocker::new(settings.locks_dir());
    let server_binary = settings
        .server_binary
        .clone()
        .unwrap_or_else(LifecycleManager::default_server_binary);
    let manager = LifecycleManager::new(locker, server_binary);
    let caller_pid = std::process::id();

    match cli.command {
        Commands::Start => {
            let outcome = manager.start_or_attach(caller_pid, port).await?;
            println!("{}", outcome.message);
        }
        Commands::Stop => match manager.stop_by_lock(caller_pid, port).await {
            Ok(outcome) => println!("{}", outcome.message),
            Err(BridgeError::NotOwner {
                port, owner_pid, ..
            }) => {
                // Ownership ambiguity is surfaced, never resolved silently.
                eprintln!(
                    "port {} is owned by pid {}; re-run with `force-stop` to terminate it anyway",
                    port, owner_pid
                );
                std::process::exit(1);
            }
            Err(e) => return Err(e.into()),
        },
        Commands::ForceStop => {
            let outcome = manager.force_stop_by_port(port).await?;
            println!("{}", outcome.message);
        }
        Commands::Status => {
            let status = manager.status(port).await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

//! Maquette RPC Server - the HTTP/JSON-RPC endpoint of the CAD bridge.
//!
//! This binary claims a port through the lock protocol, serves `/rpc`,
//! `/health` and `/shutdown`, and prints `RPC_PORT=<port>` on stdout so the
//! spawning controller (the host add-in, via the lifecycle manager) can
//! discover which port the claim landed on.

mod commands;
mod handler;
mod server;

use anyhow::{bail, Context, Result};
use clap::Parser;
use maquette_core::{BridgeSettings, CommandRegistry, LogSink, PortLocker, RpcRouter};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "maquette-rpc")]
#[command(about = "JSON-RPC server for the Maquette CAD bridge")]
struct Args {
    /// Preferred port (0 = use the settings file / default range)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Process id of the controller that spawned this server; recorded in
    /// the port claim and checked on graceful stop requests
    #[arg(long, default_value = "0")]
    owner_pid: u32,

    /// Settings file (missing file = defaults)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Command registry file (defaults to MAQUETTE_COMMANDS or
    /// commands.json next to the executable)
    #[arg(long)]
    commands: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn resolve_commands_path(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    if let Ok(path) = std::env::var("MAQUETTE_COMMANDS") {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe().context("cannot resolve current executable")?;
    match exe.parent() {
        Some(dir) => Ok(dir.join("commands.json")),
        None => bail!("cannot resolve executable directory for commands.json"),
    }
}

fn resolve_settings_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var("MAQUETTE_SETTINGS").ok().map(PathBuf::from))
        .unwrap_or_else(|| BridgeSettings::data_dir().join("settings.json"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Maquette RPC server");

    let settings = BridgeSettings::load(&resolve_settings_path(args.settings));
    let preferred_port = if args.port > 0 {
        args.port
    } else {
        settings.preferred_port
    };

    // Registry load is the one startup step allowed to be fatal: dispatch
    // relies on its metadata for risk classification.
    let commands_path = resolve_commands_path(args.commands)?;
    let registry = CommandRegistry::load(&commands_path)
        .with_context(|| format!("command registry at {}", commands_path.display()))?;
    info!(
        "Loaded {} command metadata entr{} from {}",
        registry.len(),
        if registry.len() == 1 { "y" } else { "ies" },
        commands_path.display()
    );

    let owner_pid = if args.owner_pid > 0 {
        args.owner_pid
    } else {
        std::process::id()
    };

    // Claim a port before binding anything; the claim outlives the server.
    let locker = PortLocker::new(settings.locks_dir());
    let claim = locker.acquire_available_port(preferred_port, owner_pid)?;
    let port = claim.port();

    let sink = Arc::new(LogSink::init(&settings.logs_dir(), port));
    sink.append(&format!(
        "server starting pid={} owner_pid={} port={}",
        std::process::id(),
        owner_pid,
        port
    ));

    let router = Arc::new(RpcRouter::new(registry).with_log_sink(sink.clone()));
    commands::register_builtin_commands(&router)?;

    let (addr, server_handle) = server::start_server(router, &args.host, port).await?;

    // Intentional stdout: the lifecycle manager reads this line to learn
    // which port the claim landed on.
    println!("RPC_PORT={}", addr.port());

    info!("RPC server running on {}", addr);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
        }
        _ = server_handle.wait() => {
            info!("Server drained after shutdown request, exiting");
        }
    }

    sink.append("server stopping");
    claim.release();
    Ok(())
}

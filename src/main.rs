//! Event Courier CLI - encrypted TCP event delivery server.
//!
//! This is the main binary entry point. See the `event_courier` library
//! for the core functionality.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use event_courier::commands::{self, SimulateArgs};
use event_courier::config::StoreBackend;
use event_courier::{Config, EventStore, MemoryStore, RedisStore, ServerContext, SocketServer};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// CLI
#[derive(Parser)]
#[command(name = "event-courier")]
#[command(version = VERSION)]
#[command(about = "TCP event delivery server with encrypted framing and acknowledged retries")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the delivery server (default)
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
        /// Address to bind
        #[arg(long)]
        bind: Option<String>,
        /// Storage backend
        #[arg(long, value_enum)]
        store: Option<StoreBackend>,
    },
    /// Connect simulated clients to a running server
    Simulate(SimulateArgs),
    /// Print the effective configuration
    Config,
}

fn init_logging(default_level: &str) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("COURIER_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

async fn open_store(config: &Config) -> Result<Arc<dyn EventStore>> {
    match config.store {
        StoreBackend::Redis => Ok(Arc::new(RedisStore::connect(&config.redis).await?)),
        StoreBackend::Memory => {
            log::warn!("[Store] Using in-memory store; queues are empty and nothing is persisted");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => log::warn!("Could not install SIGTERM handler: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Could not listen for Ctrl-C: {e}");
    }
}

async fn serve(config: Config) -> Result<()> {
    let key = config.cipher_key()?;
    if config.shared_key.is_none() {
        log::info!("Using the legacy shared payload key");
    }

    let store = open_store(&config).await?;
    let ctx = ServerContext::new(store, key).with_max_frame_bytes(config.max_frame_bytes);
    let server = SocketServer::start(config.listen_addr()?, ctx)?;

    println!("event-courier v{VERSION} listening on {}", server.local_addr());
    log::info!("event-courier v{VERSION} started");

    shutdown_signal().await;

    println!("Shutting down...");
    server.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load()?;
    init_logging(&config.log_level)?;

    let command = cli.command.unwrap_or(Commands::Serve {
        port: None,
        bind: None,
        store: None,
    });

    match command {
        Commands::Serve { port, bind, store } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            if let Some(store) = store {
                config.store = store;
            }
            serve(config).await?;
        }
        Commands::Simulate(args) => {
            let summary = commands::run_simulation(args, config.cipher_key()?).await?;
            if summary.connected == 0 {
                anyhow::bail!("No simulated client connected");
            }
        }
        Commands::Config => {
            let mut shown = config.clone();
            if shown.redis.password.is_some() {
                shown.redis.password = Some("<redacted>".to_string());
            }
            if shown.shared_key.is_some() {
                shown.shared_key = Some("<redacted>".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_serve() {
        let cli = Cli::try_parse_from(["event-courier"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_serve_flags_parse() {
        let cli = Cli::try_parse_from([
            "event-courier",
            "serve",
            "--port",
            "9400",
            "--bind",
            "127.0.0.1",
            "--store",
            "memory",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Serve { port, bind, store }) => {
                assert_eq!(port, Some(9400));
                assert_eq!(bind.as_deref(), Some("127.0.0.1"));
                assert_eq!(store, Some(StoreBackend::Memory));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_simulate_flags_parse() {
        let cli = Cli::try_parse_from([
            "event-courier",
            "simulate",
            "--clients",
            "5",
            "--duration",
            "3",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Simulate(args)) => {
                assert_eq!(args.clients, 5);
                assert_eq!(args.duration, 3);
                assert_eq!(args.client_event_ms, None);
            }
            _ => panic!("Expected Simulate command"),
        }
    }
}

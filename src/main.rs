//! Cambium demo and stress runner.

use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub mod scenarios;

#[derive(Parser)]
#[command(name = "cambium", version, about = "Replicate state trees across threads and processes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replicate a tree into a worker-owned mirror
    OneWay {
        #[arg(long, default_value_t = 100)]
        updates: u64,
        /// Child nodes receiving random level changes alongside each update
        #[arg(long, default_value_t = 0)]
        tracks: usize,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Bounce a value between two paired trees until it passes a limit
    Cascade {
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Publish a counter tree over TCP
    Serve {
        #[arg(long, default_value_t = 9137)]
        port: u16,
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 250)]
        interval_ms: u64,
        /// Stop after this many updates (0 = until interrupted)
        #[arg(long, default_value_t = 0)]
        updates: u64,
    },
    /// Mirror a served counter tree
    Connect {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 9137)]
        port: u16,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::OneWay {
            updates,
            tracks,
            seed,
        } => scenarios::one_way(updates, tracks, seed)?.print(),
        Command::Cascade { limit } => scenarios::cascade(limit)?.print(),
        Command::Serve {
            port,
            bind,
            interval_ms,
            updates,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(scenarios::serve(
                port,
                &bind,
                Duration::from_millis(interval_ms.max(1)),
                updates,
            ))?;
        }
        Command::Connect { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(scenarios::connect(&host, port))?;
        }
    }
    Ok(())
}

//! mindmap-server binary.
//!
//! Runs either the sync server or the relay broker that connects several
//! sync servers.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{error, info};

use mindmap_collab::{RelayBroker, SyncConfig, SyncServer};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "mindmap-server")]
#[command(about = "Real-time collaborative mind-map sync server")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the configured bind address
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay broker instead of a sync server
    Broker {
        #[arg(short, long, value_name = "ADDR", default_value = "127.0.0.1:9191")]
        bind: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    if let Some(Command::Broker { bind }) = args.command {
        info!("Starting relay broker on {bind}");
        let broker = RelayBroker::new(bind);
        tokio::select! {
            result = broker.run() => result?,
            _ = tokio::signal::ctrl_c() => info!("Relay broker stopped"),
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    info!("Starting mindmap sync server on {}", config.bind_addr);
    let server = SyncServer::open(config)?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Sync server stopped: {e}");
            }
            server.shutdown().await;
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            server.shutdown().await;
        }
    }
    Ok(())
}

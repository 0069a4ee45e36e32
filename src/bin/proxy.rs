//! Proxy binary

use clap::{Parser, Subcommand};
use repoward::{Config, Proxy};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "repoward-proxy")]
#[command(about = "Replication-aware proxy for Git storage nodes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy
    Serve {
        /// TOML configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Bind address for the HTTP API
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Database directory
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Validate a configuration file and exit
    Check {
        #[arg(long, short)]
        config: PathBuf,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen, db } => {
            // file, then environment, then flags
            let mut config = Config::load(config.as_deref())?;
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if let Some(db) = db {
                config.db_path = db;
            }
            init_tracing(&config.log_level);

            let proxy = Proxy::start(config)?;
            proxy.serve().await?;
        }

        Commands::Check { config } => {
            let config = Config::load(Some(&config))?;
            println!("configuration ok");
            for vs in &config.virtual_storages {
                let nodes: Vec<&str> = vs.nodes.iter().map(|n| n.storage.as_str()).collect();
                println!("  {}: {}", vs.name, nodes.join(", "));
            }
        }
    }

    Ok(())
}

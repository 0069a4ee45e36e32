//! CLI for backups and proxy inspection

use clap::{Parser, Subcommand};
use repoward::coordinator::HttpDialer;
use repoward::ops::{read_requests, Pipeline};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "repoward")]
#[command(about = "repoward backup and admin CLI")]
#[command(version)]
struct Cli {
    /// Proxy URL
    #[arg(long, default_value = "http://localhost:2305")]
    proxy: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Repository backups
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// List nodes with their health and primary role
    Nodes,

    /// List replication jobs
    Jobs {
        #[arg(long)]
        virtual_storage: Option<String>,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Back up the repositories listed as JSON lines on stdin
    Create {
        /// Backup root directory
        #[arg(long)]
        path: PathBuf,

        /// Backup id, defaults to the current UTC time
        #[arg(long)]
        id: Option<String>,

        /// Repositories backed up at once
        #[arg(long, default_value = "4")]
        parallel: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Backup {
            command: BackupCommands::Create { path, id, parallel },
        } => {
            let id = id.unwrap_or_else(|| chrono::Utc::now().format("%Y%m%d%H%M%S").to_string());
            let requests = read_requests(std::io::stdin().lock())?;
            let pipeline = Pipeline::new(Arc::new(HttpDialer::new(None)?), path, id)
                .with_parallelism(parallel);
            match pipeline.create(requests).await {
                Ok(summary) => {
                    println!("backed up {} repositories", summary.bundles.len());
                }
                Err(e) => {
                    eprint!("create: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Nodes => {
            let url = format!("{}/admin/nodes", cli.proxy.trim_end_matches('/'));
            let nodes: Vec<serde_json::Value> = get(&url).await?;
            println!("{:<16} {:<16} {:<8} {:<8} ADDRESS", "VIRTUAL STORAGE", "STORAGE", "HEALTHY", "PRIMARY");
            for node in nodes {
                println!(
                    "{:<16} {:<16} {:<8} {:<8} {}",
                    node["virtual_storage"].as_str().unwrap_or_default(),
                    node["storage"].as_str().unwrap_or_default(),
                    node["healthy"].as_bool().unwrap_or_default(),
                    node["primary"].as_bool().unwrap_or_default(),
                    node["address"].as_str().unwrap_or_default(),
                );
            }
        }

        Commands::Jobs { virtual_storage } => {
            let mut url = format!("{}/admin/jobs", cli.proxy.trim_end_matches('/'));
            if let Some(vs) = virtual_storage {
                url = format!("{}?virtual_storage={}", url, repoward::common::encode_segment(&vs));
            }
            let jobs: Vec<serde_json::Value> = get(&url).await?;
            println!("{:<8} {:<12} {:<10} {:<16} {:<6} RELATIVE PATH", "ID", "STATE", "CHANGE", "TARGET", "GEN");
            for job in jobs {
                println!(
                    "{:<8} {:<12} {:<10} {:<16} {:<6} {}",
                    job["id"],
                    job["state"].as_str().unwrap_or_default(),
                    job["change"].as_str().unwrap_or_default(),
                    job["target_storage"].as_str().unwrap_or_default(),
                    job["generation"],
                    job["relative_path"].as_str().unwrap_or_default(),
                );
            }
        }
    }

    Ok(())
}

async fn get<T: serde::de::DeserializeOwned>(url: &str) -> anyhow::Result<T> {
    let response = reqwest::get(url).await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{} returned {}: {}", url, status, body);
    }
    Ok(response.json().await?)
}

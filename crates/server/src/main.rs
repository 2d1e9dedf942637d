//! Platewise server
//!
//! Owns the account database and serves session auth over TCP.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use platewise_core::{Database, ServerConfig, SystemClock};
use platewise_net::{Server, ServerOptions};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "platewise-server")]
#[command(about = "Platewise account and session server")]
#[command(version)]
struct Cli {
    /// Config file (default: server.toml in the platform config directory)
    #[arg(short, long, env = "PLATEWISE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address from the config
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ServerConfig::load_default()?,
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    config.validate()?;

    let db_path = config.database_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Database::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    info!(path = %db_path.display(), version = db.schema_version(), "Database ready");

    let options = ServerOptions {
        session_ttl: config.session_ttl()?,
        sweep_interval: config.sweep_interval(),
    };
    let server = Server::start(config.listen_addr.as_str(), db, Arc::new(SystemClock), options)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    println!("Platewise server listening on {}", server.addr());

    tokio::signal::ctrl_c().await?;
    server.shutdown();

    Ok(())
}

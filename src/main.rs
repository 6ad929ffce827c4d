// ABOUTME: Entry point for the tally binary.
// ABOUTME: Loads .env, parses CLI overrides, initializes tracing, and runs the HTTP server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tally_server::{ModuleRegistry, TallyConfig};
use tally_store::{Connector, SqliteConnector};

const DEFAULT_LOG_FILTER: &str =
    "tally=debug,tally_server=debug,tally_store=debug,tower_http=debug";

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Analytics dashboard backend: API keys, users, and store bootstrap")]
struct Cli {
    /// Read environment variables from this file instead of ./.env
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Listening port; overrides PORT
    #[arg(long)]
    port: Option<u16>,

    /// Store location; overrides STORE_URI
    #[arg(long)]
    store_uri: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing default .env is normal; an explicitly named one must exist.
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path).with_context(|| format!("loading {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let mut config = TallyConfig::from_env().context("invalid configuration")?;
    if let Some(port) = cli.port {
        config.bind.set_port(port);
    }
    if let Some(uri) = cli.store_uri {
        config.store_uri = uri;
    }

    let connector = Arc::new(SqliteConnector::new(
        config.store_uri.clone(),
        config.connection.io_timeout,
    ));
    tracing::info!(store = %connector.describe(), "tally starting up");
    let server = tally_server::start(&config, ModuleRegistry::standard(), connector).await?;
    server.wait().await?;

    tracing::info!("tally stopped");
    Ok(())
}

//! Restless demo server
//!
//! Serves the sample person / computer / tag models from an in-memory store.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use restless_common::RestlessConfig;
use restless_core::{sample, InMemoryStore, ResourceApi};
use restless_server::RestServer;

#[derive(Parser, Debug)]
#[command(name = "restless")]
#[command(about = "JSON REST resources over relational models", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "restless.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Seed the store with sample rows
    #[arg(long, env = "RESTLESS_SAMPLE_DATA")]
    sample_data: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    info!("restless v{}", env!("CARGO_PKG_VERSION"));

    let config: RestlessConfig = if args.config.exists() {
        let content = std::fs::read_to_string(&args.config)?;
        toml::from_str(&content)?
    } else {
        info!("Using default configuration");
        RestlessConfig::default()
    };

    let registry = sample::registry()?;
    let store = InMemoryStore::new(registry.clone());
    if args.sample_data {
        sample::seed(&store)?;
        info!("Loaded sample data");
    }
    let api = Arc::new(ResourceApi::new(registry, Arc::new(store), config.api.clone()));
    let server = RestServer::new(&config.server, api);

    tokio::select! {
        result = server.run() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Received shutdown signal");
        }
    }

    Ok(())
}

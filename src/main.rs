// SPDX-License-Identifier: MIT

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tabd::config::DaemonConfig;
use tabd::provider;
use tracing::info;

#[derive(Parser)]
#[command(name = "tabd", about = "tabd — inline completion daemon", version)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(long, env = "TABD_CONFIG")]
    config: Option<PathBuf>,

    /// Provider type (inline, fim, sweep, zeta)
    #[arg(long, env = "TABD_PROVIDER")]
    provider: Option<String>,

    /// Provider server URL
    #[arg(long, env = "TABD_PROVIDER_URL")]
    provider_url: Option<String>,

    /// Model name sent to the provider
    #[arg(long, env = "TABD_MODEL")]
    model: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "TABD_LOG")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log.as_str())
        .compact()
        .init();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(kind) = &args.provider {
        config.provider_type = kind.parse()?;
    }
    if let Some(url) = &args.provider_url {
        config.provider.provider_url = url.clone();
    }
    if let Some(model) = &args.model {
        config.provider.provider_model = model.clone();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        provider = ?config.provider_type,
        url = %config.provider.provider_url,
        "tabd starting"
    );

    // Fail fast on unusable provider configuration (e.g. a missing hosted
    // Sweep API key) before any editor connects.
    let _provider: Arc<dyn provider::CompletionProvider> =
        Arc::new(provider::new_provider(&config)?);
    info!("provider ready; waiting for editor frontends");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

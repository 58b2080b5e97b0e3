use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vdm_core::auth::EnvOAuthTokens;
use vdm_core::{Config, Gateway};

mod cli;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Cli::parse();
    let (host_override, port_override) = match args.command {
        Some(Command::Serve { host, port }) => (host, port),
        None => (None, None),
    };

    let config = Config::load_from_env().context("failed to load configuration")?;
    let mut settings = config.settings.clone();
    if let Some(host) = host_override {
        settings.host = host;
    }
    if let Some(port) = port_override {
        settings.port = port;
    }

    if config.providers.is_empty() {
        tracing::warn!("no providers configured; set <PROVIDER>_API_KEY to add one");
    }
    for provider in &config.providers {
        tracing::info!(
            provider = %provider.name,
            format = provider.api_format.as_str(),
            auth = provider.auth_mode.as_str(),
            keys = provider.api_keys.len(),
            "provider configured"
        );
    }

    let gateway = Arc::new(Gateway::new(
        Config {
            settings: settings.clone(),
            ..config
        },
        Arc::new(EnvOAuthTokens),
    ));
    let app = vdm_router::router(gateway);

    let bind = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!("listening on {bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

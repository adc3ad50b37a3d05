// crossgate - multi-tenant gateway for an AWS-style LLM event stream
//
// Exposes OpenAI- and Anthropic-compatible chat endpoints and translates
// them onto the upstream provider's framed event-stream protocol.
//
// Architecture:
// - Server (axum): client endpoints, auth, error mapping
// - Converters: OpenAI/Anthropic -> normalized -> upstream payload
// - Streaming engine: upstream frames -> OpenAI or Anthropic SSE
// - Credential pool: scored allocation, cached auth managers, health checks
// - Store (SQLite): credentials, external accounts, client keys

mod auth;
mod cli;
mod config;
mod convert;
mod error;
mod parser;
mod pool;
mod server;
mod store;
mod stream;
mod tokens;
mod util;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::Cli;
use config::Config;
use pool::health::HealthChecker;
use server::AppState;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load();
    cli.apply(&mut config);

    // File logging alongside stderr output
    std::fs::create_dir_all(&config.log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "crossgate.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    tracing::info!("crossgate {} starting", config::VERSION);

    if config.encryption_secret.is_empty() {
        tracing::warn!(
            "CROSSGATE_ENCRYPTION_SECRET is not set; stored secrets use a default key"
        );
    }

    let store = Store::open(&config.database_path, &config.encryption_secret)
        .context("Failed to open database")?;

    if let Some(command) = &cli.command {
        if cli::run_admin_command(command, &store, &config)? {
            return Ok(());
        }
    }

    // Background credential health sweeps
    let health_task = HealthChecker::new(
        store.clone(),
        config.token_health_check_interval,
        config.region.clone(),
        config.profile_arn.clone(),
    )
    .spawn();

    let state = Arc::new(AppState::new(config, store));

    // Graceful shutdown on ctrl-c
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    let result = server::serve(state, shutdown_rx).await;

    health_task.abort();
    tracing::info!("Token health checker stopped");

    result
}

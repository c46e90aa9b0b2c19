//! The Pulse scheduled dispatch engine.

mod app;
mod conductor;
mod config;
#[cfg(test)]
mod config_test;
mod coordination;
mod database;
mod dispatch;
mod error;
#[cfg(test)]
mod fixtures;
mod hub;
mod models;
mod timers;
mod trigger;
mod utils;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        role = %cfg.role,
        storage_data_path = %cfg.storage_data_path,
        gap_seconds = %cfg.gap_seconds,
        election_interval_seconds = %cfg.election_interval_seconds,
        lease_duration_seconds = %cfg.lease_duration_seconds,
        "starting Pulse dispatch engine",
    );
    if let Err(err) = App::new(cfg).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}

// src/main.rs

//! The main entry point for the Lustra HA agent.

use anyhow::{Context, Result};
use lustra_agent::core::{DEFAULT_COORDINATOR_URL, MGR_COMMAND};
use lustra_agent::supervisor::Supervisor;
use std::env;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    // Initialize logging. The agent state machines default to debug so that
    // leadership changes are visible without extra configuration.
    let log_level = env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,lustra_agent::core::agent=debug".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    let coordinator_url = env::var("LUSTRA_COORDINATOR_URL")
        .unwrap_or_else(|_| DEFAULT_COORDINATOR_URL.to_string());

    // The hostname must match the topology's host list; an override is
    // available for containers whose kernel hostname differs.
    let local_hostname = match env::var("LUSTRA_HOSTNAME") {
        Ok(name) if !name.is_empty() => name,
        _ => hostname::get()
            .context("Failed to resolve the local hostname")?
            .to_string_lossy()
            .into_owned(),
    };

    info!("Lustra HA agent {VERSION} starting on host '{local_hostname}'.");

    let supervisor = Supervisor::new(coordinator_url, MGR_COMMAND, local_hostname);
    if let Err(e) = supervisor.run().await {
        error!("Agent runtime error: {e:#}");
        return Err(e);
    }

    Ok(())
}

// src/supervisor/mod.rs

//! Builds and supervises every agent task on this node, and owns the single
//! shutdown channel.
//!
//! Startup order: load the topology, derive the local responsibilities,
//! spawn the version-check task, then one config watcher and one driver per
//! charge. After that the supervisor waits for SIGINT/SIGTERM, closes the
//! shutdown channel exactly once, and drains every task.

use crate::config::ConfigLoader;
use crate::core::WATCH_FANOUT;
use crate::core::agent::host::HostCharge;
use crate::core::agent::runtime::{RuntimeConfigWatcher, RuntimeSlot};
use crate::core::agent::service::ServiceCharge;
use crate::core::agent::{AgentDriver, Supervisable};
use crate::core::coordinator::{Coordinator, HttpCoordinator};
use crate::core::mgr::MgrCommand;
use crate::core::tasks::version_check::VersionCheckTask;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

// Platform-specific signal handling imports
#[cfg(windows)]
use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Waits for a shutdown signal. On Unix SIGINT and SIGTERM shut the agent
/// down; SIGHUP is observed and ignored. On Windows it is Ctrl+C.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to create SIGHUP stream");

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("SIGINT received, initiating graceful shutdown.");
                    return;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, initiating graceful shutdown.");
                    return;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received and ignored.");
                }
            }
        }
    }

    #[cfg(windows)]
    {
        let mut ctrl_c = signal::windows::ctrl_c().expect("Failed to create Ctrl+C stream");
        ctrl_c.recv().await;
        info!("Ctrl-C received, initiating graceful shutdown.");
    }
}

/// Owns the whole agent process after startup.
pub struct Supervisor {
    coordinator_url: String,
    mgr_program: String,
    hostname: String,
}

impl Supervisor {
    pub fn new(
        coordinator_url: impl Into<String>,
        mgr_program: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            coordinator_url: coordinator_url.into(),
            mgr_program: mgr_program.into(),
            hostname: hostname.into(),
        }
    }

    pub async fn run(self) -> Result<()> {
        let mgr = MgrCommand::new(&self.mgr_program);

        let topology = ConfigLoader::new(mgr.clone()).load().await?;
        info!(
            "Topology loaded: {} filesystem(s), {} host(s).",
            topology.filesystems.len(),
            topology.hosts.len()
        );

        let local_instances = topology.local_instances(&self.hostname);
        let neighbours = topology.neighbour_hosts(&self.hostname, WATCH_FANOUT)?;
        info!(
            "Host '{}' supervises {} local service(s) and watches {} neighbour host(s).",
            self.hostname,
            local_instances.len(),
            neighbours.len()
        );

        let coordinator: Arc<dyn Coordinator> =
            Arc::new(HttpCoordinator::new(&self.coordinator_url));
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks: JoinSet<()> = JoinSet::new();

        tasks.spawn(VersionCheckTask::new(mgr.clone()).run(shutdown_tx.subscribe()));

        for instance in &local_instances {
            spawn_agent(
                ServiceCharge::new(&instance.service_name),
                &coordinator,
                &mgr,
                &shutdown_tx,
                &mut tasks,
            );
        }
        for host in &neighbours {
            spawn_agent(
                HostCharge::new(&host.hostname),
                &coordinator,
                &mgr,
                &shutdown_tx,
                &mut tasks,
            );
        }

        loop {
            tokio::select! {
                biased; // Prioritize shutdown signals over task reaping.

                _ = await_shutdown_signal() => break,

                maybe = tasks.join_next() => match maybe {
                    Some(Ok(())) => {}
                    Some(Err(e)) if e.is_panic() => error!("An agent task panicked: {e:?}"),
                    Some(Err(_)) => {}
                    None => {
                        warn!("All agent tasks finished before any shutdown signal.");
                        break;
                    }
                }
            }
        }

        // --- Graceful shutdown sequence ---
        info!("Shutting down. Sending signal to all tasks.");
        if shutdown_tx.send(()).is_err() {
            warn!("No task was listening for shutdown.");
        }

        // Every agent releases its lock on the way out; the bound covers one
        // session TTL plus a slow child process still being waited on.
        info!("Waiting for agent tasks to finish...");
        if tokio::time::timeout(Duration::from_secs(30), async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        error!("A task panicked during shutdown: {e:?}");
                    }
                }
            }
        })
        .await
        .is_err()
        {
            warn!("Timed out waiting for agent tasks to finish cleanly.");
        }
        info!("Agent shutdown complete.");
        Ok(())
    }
}

/// Spawns the config watcher and the driver for one charge.
fn spawn_agent<S: Supervisable>(
    charge: S,
    coordinator: &Arc<dyn Coordinator>,
    mgr: &MgrCommand,
    shutdown_tx: &broadcast::Sender<()>,
    tasks: &mut JoinSet<()>,
) {
    let slot = RuntimeSlot::new();
    let watcher = RuntimeConfigWatcher::new(coordinator.clone(), charge.config_key(), slot.clone());
    tasks.spawn(watcher.run(shutdown_tx.subscribe()));

    let driver = AgentDriver::new(charge, coordinator.clone(), mgr.clone(), slot);
    tasks.spawn(driver.run(shutdown_tx.subscribe()));
}

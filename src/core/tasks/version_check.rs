// src/core/tasks/version_check.rs

//! Daily, jittered invocation of the management CLI's version check.
//!
//! Every node runs this; the stagger spreads the load so a large cluster
//! does not hammer the package repository at the same instant.

use crate::core::mgr::MgrCommand;
use crate::core::utils::{random_stagger, random_stagger_quarter};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Upper bound of the uniform delay before the first check.
pub const VERSION_CHECK_MAX_INITIAL_DELAY: Duration = Duration::from_secs(30);

/// Nominal cadence of subsequent checks; each interval is quarter-staggered.
pub const VERSION_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// The background task struct for the periodic version check.
pub struct VersionCheckTask {
    mgr: MgrCommand,
}

impl VersionCheckTask {
    pub fn new(mgr: MgrCommand) -> Self {
        Self { mgr }
    }

    /// The main run loop. Informational only; never aborts the agent.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut delay = random_stagger(VERSION_CHECK_MAX_INITIAL_DELAY);
        debug!("First version check in {:.1}s.", delay.as_secs_f64());

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    debug!("Version check task shutting down.");
                    return;
                }
                _ = time::sleep(delay) => {}
            }
            self.check_version().await;
            delay = random_stagger_quarter(VERSION_CHECK_INTERVAL);
        }
    }

    async fn check_version(&self) {
        match self.mgr.run(&["version_check", "--no_log_prefix"]).await {
            Ok(report) => {
                if !report.stdout.trim().is_empty() {
                    info!("Version check: {}", report.stdout_escaped());
                }
                if !report.stderr.trim().is_empty() {
                    error!("Version check errors: {}", report.stderr_escaped());
                }
                if !report.success {
                    warn!(
                        "'{}' exited with {} after {:.3}s.",
                        report.command_line,
                        report.exit_label(),
                        report.duration_secs()
                    );
                }
            }
            Err(e) => error!("Cannot run version check: {e}"),
        }
    }
}

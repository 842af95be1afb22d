// src/core/agent/runtime.rs

//! Per-agent runtime configuration, updated live from the coordinator KV.
//!
//! Each agent owns one [`RuntimeSlot`]; a [`RuntimeConfigWatcher`] task
//! subscribes to the charge's config key and publishes parsed updates into
//! the slot. The slot is single-writer (the watcher) and single-reader (the
//! supervisory loop), so a plain atomic publication suffices.

use crate::core::coordinator::{Coordinator, KvPair};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, warn};

/// Runtime-toggleable agent settings, stored as YAML under the charge's
/// config key. Absent keys fall back to the defaults below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct RuntimeConfig {
    /// Gates whether a leader actively runs the mount/start command.
    #[serde(default)]
    pub autostart: bool,
}

/// The slot a watcher publishes into. Updates replace, never mutate.
#[derive(Debug, Default)]
pub struct RuntimeSlot {
    autostart: AtomicBool,
}

impl RuntimeSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, config: RuntimeConfig) {
        self.autostart.store(config.autostart, Ordering::Release);
    }

    pub fn autostart_enabled(&self) -> bool {
        self.autostart.load(Ordering::Acquire)
    }
}

/// Watches one config key and publishes parsed updates into the slot.
pub struct RuntimeConfigWatcher {
    coordinator: Arc<dyn Coordinator>,
    key: String,
    slot: Arc<RuntimeSlot>,
}

impl RuntimeConfigWatcher {
    pub fn new(coordinator: Arc<dyn Coordinator>, key: String, slot: Arc<RuntimeSlot>) -> Self {
        Self {
            coordinator,
            key,
            slot,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut index = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    debug!("Config watcher for '{}' shutting down.", self.key);
                    return;
                }
                res = self.coordinator.watch(&self.key, index) => match res {
                    Ok((pair, next_index)) => {
                        index = next_index;
                        self.apply(pair);
                    }
                    Err(e) => {
                        debug!("Config watch on '{}' failed: {e}; retrying.", self.key);
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.recv() => return,
                            _ = time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                }
            }
        }
    }

    /// Applies one observed value. Deletion and initial absence revert to
    /// the defaults; malformed YAML is logged and discarded, so the last
    /// good value stays in effect.
    fn apply(&self, pair: Option<KvPair>) {
        let Some(pair) = pair else {
            self.slot.publish(RuntimeConfig::default());
            return;
        };
        match serde_yaml::from_slice::<RuntimeConfig>(&pair.value) {
            Ok(config) => {
                debug!(
                    "Runtime config for '{}': autostart={}.",
                    self.key, config.autostart
                );
                self.slot.publish(config);
            }
            Err(e) => {
                warn!(
                    "Ignoring malformed runtime config at '{}': {e}; keeping the previous value.",
                    self.key
                );
            }
        }
    }
}

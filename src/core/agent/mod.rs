// src/core/agent/mod.rs

//! The supervisory state machine shared by service and host agents.
//!
//! A [`Supervisable`] charge describes what is being kept alive: its lock
//! and config keys in the coordinator, the management subcommand that
//! actuates it, and the stdout marker meaning "nothing was to be done". The
//! single [`AgentDriver`] runs the election loop around any charge:
//!
//! ```text
//! RESOLVE -> ACQUIRING -> LEADING -> RELEASING -> (RESOLVE | TERMINATED)
//! ```
//!
//! Every suspension point selects on the shared shutdown channel; a held
//! lock is always released before the task returns.

pub mod host;
pub mod runtime;
pub mod service;

use crate::core::coordinator::{Coordinator, HeldLock};
use crate::core::errors::AgentError;
use crate::core::mgr::MgrCommand;
use crate::core::{SESSION_TTL, SESSION_TTL_SECONDS};
use runtime::RuntimeSlot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Behavior of a charge's status value. Both service and host statuses are
/// three-valued: unknown until the first actuation, then the outcome of the
/// most recent one.
pub trait ChargeStatus: Copy + Eq + Send + Sync + 'static {
    fn unknown() -> Self;
    fn from_outcome(success: bool) -> Self;
    fn label(self) -> &'static str;
}

/// One unit of responsibility an agent can hold cluster-wide leadership for.
pub trait Supervisable: Send + Sync + 'static {
    type Status: ChargeStatus;

    /// Canonical name: the service name or the hostname.
    fn name(&self) -> &str;

    /// `"service"` or `"host"`, for log records.
    fn kind(&self) -> &'static str;

    /// Coordinator key of the leadership lock.
    fn lock_key(&self) -> String;

    /// Coordinator key of the runtime config.
    fn config_key(&self) -> String;

    /// Argv passed to the management CLI to actuate the charge.
    fn action_args(&self) -> Vec<String>;

    /// Whole-stdout marker meaning the charge was already actuated.
    fn already_ok_marker(&self) -> &'static str;
}

/// Drives one charge: elects a leader through the coordinator lock and,
/// while leading, periodically actuates the charge if autostart is enabled.
pub struct AgentDriver<S: Supervisable> {
    charge: S,
    coordinator: Arc<dyn Coordinator>,
    mgr: MgrCommand,
    runtime: Arc<RuntimeSlot>,
    agent_id: String,
    status: S::Status,
    last_autostart: Option<bool>,
}

impl<S: Supervisable> AgentDriver<S> {
    pub fn new(
        charge: S,
        coordinator: Arc<dyn Coordinator>,
        mgr: MgrCommand,
        runtime: Arc<RuntimeSlot>,
    ) -> Self {
        Self {
            charge,
            coordinator,
            mgr,
            runtime,
            agent_id: Uuid::new_v4().to_string(),
            status: S::Status::unknown(),
            last_autostart: None,
        }
    }

    /// The lock value this agent writes; compared only for equality.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The supervisory task for this charge. Runs until shutdown.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Agent {} supervising {} '{}'.",
            self.agent_id,
            self.charge.kind(),
            self.charge.name()
        );

        loop {
            // RESOLVE: observational read of the current holder.
            if self.read_lock_holder(&mut shutdown_rx).await.is_err() {
                break;
            }

            // ACQUIRING: block until we lead or shutdown fires.
            let mut guard = match self.acquire(&mut shutdown_rx).await {
                Ok(guard) => guard,
                Err(_) => break,
            };
            info!(
                "Acquired leadership of {} '{}'.",
                self.charge.kind(),
                self.charge.name()
            );

            // LEADING: actuate on every tick until leadership is lost.
            let cancelled = self.maintain(guard.as_mut(), &mut shutdown_rx).await;

            // RELEASING: always give the lock back before looping or exiting.
            guard.release().await;
            if cancelled {
                break;
            }
            info!(
                "Lost leadership of {} '{}'; re-entering election.",
                self.charge.kind(),
                self.charge.name()
            );
        }

        debug!(
            "Agent for {} '{}' terminated.",
            self.charge.kind(),
            self.charge.name()
        );
    }

    /// Reads who currently holds the lock. The result only feeds the log;
    /// acquisition below does not depend on it. Retries once per second for
    /// at most a session TTL before declaring the coordinator unreachable.
    async fn read_lock_holder(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<(), AgentCancelled> {
        let key = self.charge.lock_key();
        for attempt in 1..=SESSION_TTL_SECONDS {
            match self.coordinator.get(&key).await {
                Ok(pair) => {
                    let (held, holder) = match &pair {
                        None => (false, String::new()),
                        Some(p) => (
                            p.session.is_some(),
                            String::from_utf8_lossy(&p.value).into_owned(),
                        ),
                    };
                    debug!("Lock '{key}' held={held} holder='{holder}'.");
                    return Ok(());
                }
                Err(e) => {
                    debug!("Lock read of '{key}' failed (attempt {attempt}): {e}");
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => return Err(AgentCancelled),
                        _ = time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        warn!("Coordinator unreachable while reading lock '{key}'; proceeding to acquisition.");
        Ok(())
    }

    /// Blocks until this agent holds the lock. Retries failed attempts at
    /// session-TTL spacing indefinitely; only shutdown aborts.
    async fn acquire(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<Box<dyn HeldLock>, AgentCancelled> {
        let key = self.charge.lock_key();
        loop {
            match self.coordinator.lock(&key, &self.agent_id, shutdown_rx).await {
                Ok(guard) => return Ok(guard),
                Err(AgentError::Cancelled) => return Err(AgentCancelled),
                Err(e) => {
                    warn!(
                        "Lock acquisition for '{key}' failed: {e}; retrying in {SESSION_TTL_SECONDS}s."
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => return Err(AgentCancelled),
                        _ = time::sleep(SESSION_TTL) => {}
                    }
                }
            }
        }
    }

    /// The maintain loop: one tick per session TTL while leading. Returns
    /// true when shutdown fired, false when leadership was lost.
    async fn maintain(
        &mut self,
        guard: &mut dyn HeldLock,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> bool {
        let mut tick = time::interval(SESSION_TTL);
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return true,
                _ = guard.lost() => return false,
                _ = tick.tick() => {
                    let enabled = self.runtime.autostart_enabled();
                    if self.last_autostart != Some(enabled) {
                        if enabled {
                            info!(
                                "Autostart enabled for {} '{}'.",
                                self.charge.kind(),
                                self.charge.name()
                            );
                        } else {
                            info!(
                                "Autostart disabled for {} '{}'; leading passively.",
                                self.charge.kind(),
                                self.charge.name()
                            );
                        }
                        self.last_autostart = Some(enabled);
                    }
                    if enabled {
                        self.actuate().await;
                    }
                }
            }
        }
    }

    /// One actuation: run the management subcommand, derive the new status,
    /// log transitions and unexpected re-actuations.
    async fn actuate(&mut self) {
        let args = self.charge.action_args();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let report = match self.mgr.run(&arg_refs).await {
            Ok(report) => report,
            Err(e) => {
                error!(
                    "Cannot actuate {} '{}': {e}",
                    self.charge.kind(),
                    self.charge.name()
                );
                self.status = S::Status::from_outcome(false);
                return;
            }
        };

        let new_status = S::Status::from_outcome(report.success);
        if !report.success {
            warn!(
                "'{}' failed after {:.3}s: exit={} stdout='{}' stderr='{}'",
                report.command_line,
                report.duration_secs(),
                report.exit_label(),
                report.stdout_escaped(),
                report.stderr_escaped()
            );
        }

        if new_status != self.status {
            info!(
                "Status of {} '{}' changed: {} -> {} ({:.3}s)",
                self.charge.kind(),
                self.charge.name(),
                self.status.label(),
                new_status.label(),
                report.duration_secs()
            );
        } else if report.success
            && self.status == S::Status::from_outcome(true)
            && report.stdout.trim() != self.charge.already_ok_marker()
        {
            // The command succeeded again without the already-ok marker, so
            // something outside this agent took the charge down in between.
            warn!(
                "{} '{}' was re-actuated unexpectedly; stale status suspected (stdout='{}').",
                self.charge.kind(),
                self.charge.name(),
                report.stdout_escaped()
            );
        }
        self.status = new_status;
    }
}

/// Internal marker: the shared cancellation channel fired.
struct AgentCancelled;

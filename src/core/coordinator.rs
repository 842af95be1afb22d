// src/core/coordinator.rs

//! Facade over the external distributed coordinator, a Consul-compatible
//! KV/session/lock store.
//!
//! The rest of the agent sees only the [`Coordinator`] trait. The HTTP
//! client below retries transient transport errors internally and surfaces
//! only unreachability and cancellation; the advisory-lock semantics
//! (session-bound keys, leases, blocking queries) are the coordinator's.

use crate::core::errors::AgentError;
use crate::core::{SESSION_TTL, SESSION_TTL_SECONDS};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

/// One KV pair as read from the coordinator.
#[derive(Debug, Clone)]
pub struct KvPair {
    pub value: Vec<u8>,
    /// Session currently bound to the key (the lock holder), if any.
    pub session: Option<String>,
}

/// A lock held on the coordinator.
///
/// Dropping a guard without [`HeldLock::release`] leaves cleanup to session
/// expiry; agents always release explicitly on the way out.
#[async_trait]
pub trait HeldLock: Send {
    /// Resolves when leadership is lost: the session expired or the key was
    /// re-bound to another session. Pends forever while the lock is held.
    /// Cancel-safe; resolves immediately on every call once lost.
    async fn lost(&mut self);

    /// Releases the lock and tears the session down.
    async fn release(self: Box<Self>);
}

/// Capabilities the agent requires from the coordinator.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Strongly consistent read of one key.
    async fn get(&self, key: &str) -> Result<Option<KvPair>, AgentError>;

    /// Blocks until the key changes relative to `index` (or the server-side
    /// wait expires), returning the current pair and the index to wait on
    /// next. An `index` of zero returns the current state immediately.
    async fn watch(&self, key: &str, index: u64) -> Result<(Option<KvPair>, u64), AgentError>;

    /// Blocks until the advisory lock at `key` is acquired with `value` as
    /// the lock value, or shutdown fires ([`AgentError::Cancelled`]).
    async fn lock(
        &self,
        key: &str,
        value: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Box<dyn HeldLock>, AgentError>;
}

const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// `Coordinator` implementation over the coordinator's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpCoordinator {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct KvEntry {
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "Session")]
    session: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

impl HttpCoordinator {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// Reads one key with the given query string. Returns the pair (absent
    /// on 404 or empty result) and the index reported by the coordinator.
    async fn kv_query(
        &self,
        key: &str,
        query: &str,
    ) -> Result<(Option<KvPair>, u64), AgentError> {
        let url = format!("{}/v1/kv/{key}?{query}", self.base_url);
        let resp = self.http.get(&url).send().await?;

        let index = resp
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok((None, index));
        }
        if !resp.status().is_success() {
            return Err(AgentError::Unreachable(format!(
                "read of '{key}' returned HTTP {}",
                resp.status()
            )));
        }

        let entries: Vec<KvEntry> = resp.json().await?;
        let Some(entry) = entries.into_iter().next() else {
            return Ok((None, index));
        };

        let value = match entry.value {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| AgentError::Parse(format!("undecodable value at '{key}': {e}")))?,
            None => Vec::new(),
        };
        let index = if index > 0 { index } else { entry.modify_index };

        Ok((
            Some(KvPair {
                value,
                session: entry.session,
            }),
            index,
        ))
    }

    /// Opens a session with the renewable lease the agent's locks live on.
    async fn create_session(&self, name: &str) -> Result<String, AgentError> {
        let url = format!("{}/v1/session/create", self.base_url);
        let body = json!({
            "Name": name,
            "TTL": format!("{SESSION_TTL_SECONDS}s"),
            "Behavior": "delete",
            "LockDelay": "1s",
        });
        let resp = self.http.put(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(AgentError::Unreachable(format!(
                "session create returned HTTP {}",
                resp.status()
            )));
        }
        let created: SessionCreated = resp.json().await?;
        Ok(created.id)
    }

    /// Renews the session lease. `Ok(false)` means the session is gone.
    async fn renew_session(&self, session: &str) -> Result<bool, AgentError> {
        let url = format!("{}/v1/session/renew/{session}", self.base_url);
        let resp = self.http.put(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            return Err(AgentError::Unreachable(format!(
                "session renew returned HTTP {}",
                resp.status()
            )));
        }
        Ok(true)
    }

    async fn destroy_session(&self, session: &str) -> Result<(), AgentError> {
        let url = format!("{}/v1/session/destroy/{session}", self.base_url);
        let resp = self.http.put(&url).send().await?;
        if !resp.status().is_success() {
            return Err(AgentError::Unreachable(format!(
                "session destroy returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// One acquisition attempt. `Ok(false)` means another session holds it.
    async fn try_acquire(
        &self,
        key: &str,
        session: &str,
        value: &str,
    ) -> Result<bool, AgentError> {
        let url = format!("{}/v1/kv/{key}?acquire={session}", self.base_url);
        let resp = self.http.put(&url).body(value.to_string()).send().await?;
        if !resp.status().is_success() {
            return Err(AgentError::Unreachable(format!(
                "acquire of '{key}' returned HTTP {}",
                resp.status()
            )));
        }
        let text = resp.text().await?;
        Ok(text.trim() == "true")
    }

    async fn release_key(&self, key: &str, session: &str) -> Result<(), AgentError> {
        let url = format!("{}/v1/kv/{key}?release={session}", self.base_url);
        let resp = self.http.put(&url).send().await?;
        if !resp.status().is_success() {
            return Err(AgentError::Unreachable(format!(
                "release of '{key}' returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, AgentError> {
        let (pair, _) = self.kv_query(key, "consistent").await?;
        Ok(pair)
    }

    async fn watch(&self, key: &str, index: u64) -> Result<(Option<KvPair>, u64), AgentError> {
        self.kv_query(key, &format!("index={index}&wait={SESSION_TTL_SECONDS}s"))
            .await
    }

    async fn lock(
        &self,
        key: &str,
        value: &str,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<Box<dyn HeldLock>, AgentError> {
        // A fresh session per lock attempt; the session is the lease the
        // leadership lives on, owned by exactly one agent.
        let mut attempts = 0u64;
        let session = loop {
            match self.create_session(key).await {
                Ok(session) => break session,
                Err(e) => {
                    attempts += 1;
                    if attempts >= SESSION_TTL_SECONDS {
                        return Err(e);
                    }
                    debug!("Session create for '{key}' failed: {e}; retrying.");
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => return Err(AgentError::Cancelled),
                        _ = time::sleep(RETRY_PAUSE) => {}
                    }
                }
            }
        };

        let mut wait_index = 0u64;
        let mut attempts = 0u64;
        loop {
            match self.try_acquire(key, &session, value).await {
                Ok(true) => break,
                Ok(false) => {
                    attempts = 0;
                    // Held elsewhere: block until the key changes, then retry.
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            let _ = self.destroy_session(&session).await;
                            return Err(AgentError::Cancelled);
                        }
                        res = self.watch(key, wait_index) => match res {
                            Ok((_, index)) => wait_index = index,
                            Err(e) => {
                                debug!("Watch on '{key}' failed while queued: {e}");
                                time::sleep(RETRY_PAUSE).await;
                            }
                        }
                    }
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= SESSION_TTL_SECONDS {
                        let _ = self.destroy_session(&session).await;
                        return Err(e);
                    }
                    debug!("Acquire of '{key}' failed: {e}; retrying.");
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            let _ = self.destroy_session(&session).await;
                            return Err(AgentError::Cancelled);
                        }
                        _ = time::sleep(RETRY_PAUSE) => {}
                    }
                }
            }
        }

        let (lost_tx, lost_rx) = watch::channel(false);
        let lost_tx = Arc::new(lost_tx);
        let renew_task = tokio::spawn(renew_loop(
            self.clone(),
            session.clone(),
            lost_tx.clone(),
        ));
        let watch_task = tokio::spawn(watch_lock_loop(
            self.clone(),
            key.to_string(),
            session.clone(),
            lost_tx,
        ));

        Ok(Box::new(HttpHeldLock {
            coordinator: self.clone(),
            key: key.to_string(),
            session,
            lost_rx,
            renew_task,
            watch_task,
        }))
    }
}

/// Renews the session at half the TTL. Two consecutive failures span a full
/// TTL, at which point the lease is gone and leadership with it.
async fn renew_loop(
    coordinator: HttpCoordinator,
    session: String,
    lost: Arc<watch::Sender<bool>>,
) {
    let mut timer = time::interval(SESSION_TTL / 2);
    timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    timer.tick().await; // The first tick completes immediately.

    let mut failures = 0u32;
    loop {
        timer.tick().await;
        match coordinator.renew_session(&session).await {
            Ok(true) => failures = 0,
            Ok(false) => {
                warn!("Session '{session}' expired on the coordinator.");
                let _ = lost.send(true);
                return;
            }
            Err(e) => {
                failures += 1;
                debug!("Session renew failed ({failures}): {e}");
                if failures >= 2 {
                    warn!("Session '{session}' could not be renewed within its TTL; assuming lost.");
                    let _ = lost.send(true);
                    return;
                }
            }
        }
    }
}

/// Watches the lock key; if it stops being bound to our session, the lock
/// was taken away (expiry cleanup or an administrative steal).
async fn watch_lock_loop(
    coordinator: HttpCoordinator,
    key: String,
    session: String,
    lost: Arc<watch::Sender<bool>>,
) {
    let mut index = 0u64;
    loop {
        match coordinator.watch(&key, index).await {
            Ok((pair, next_index)) => {
                index = next_index;
                let still_ours =
                    pair.as_ref().and_then(|p| p.session.as_deref()) == Some(session.as_str());
                if !still_ours {
                    warn!("Lock '{key}' is no longer bound to session '{session}'.");
                    let _ = lost.send(true);
                    return;
                }
            }
            Err(e) => {
                // Transient; the renew loop is the authority on lease loss.
                debug!("Watch on held lock '{key}' failed: {e}");
                time::sleep(RETRY_PAUSE).await;
            }
        }
    }
}

struct HttpHeldLock {
    coordinator: HttpCoordinator,
    key: String,
    session: String,
    lost_rx: watch::Receiver<bool>,
    renew_task: JoinHandle<()>,
    watch_task: JoinHandle<()>,
}

#[async_trait]
impl HeldLock for HttpHeldLock {
    async fn lost(&mut self) {
        loop {
            if *self.lost_rx.borrow_and_update() {
                return;
            }
            if self.lost_rx.changed().await.is_err() {
                // Sender side gone; the keeper never outlives a held lock.
                return;
            }
        }
    }

    async fn release(self: Box<Self>) {
        self.renew_task.abort();
        self.watch_task.abort();
        if let Err(e) = self.coordinator.release_key(&self.key, &self.session).await {
            warn!("Failed to release lock '{}' cleanly: {e}", self.key);
        }
        if let Err(e) = self.coordinator.destroy_session(&self.session).await {
            debug!("Failed to destroy session '{}': {e}", self.session);
        }
    }
}

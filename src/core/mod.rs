// src/core/mod.rs

//! The central module containing the core logic and data structures of the
//! Lustra HA agent.

pub mod agent;
pub mod coordinator;
pub mod errors;
pub mod mgr;
pub mod tasks;
pub mod utils;

pub use errors::AgentError;

use std::time::Duration;

/// Renewable TTL of every coordinator session. Doubles as the supervisory
/// tick cadence and as the spacing of lock-acquisition retries.
pub const SESSION_TTL: Duration = Duration::from_secs(10);

/// [`SESSION_TTL`] in whole seconds, for retry counting.
pub const SESSION_TTL_SECONDS: u64 = 10;

/// Upper bound on how many peers watch any given host.
pub const WATCH_FANOUT: usize = 3;

/// Root of every key this agent touches in the coordinator KV.
pub const KV_NAMESPACE: &str = "lustra";

/// The management command-line tool driven by the agent.
pub const MGR_COMMAND: &str = "lustra";

/// Whole-stdout marker: the mount command found the service already mounted.
pub const MSG_ALREADY_MOUNTED: &str = "already mounted";

/// Whole-stdout marker: the host-start command found the host already up.
pub const MSG_ALREADY_STARTED: &str = "already started";

/// Default coordinator HTTP endpoint.
pub const DEFAULT_COORDINATOR_URL: &str = "http://127.0.0.1:8500";

// src/core/agent/host.rs

//! The host charge: a neighbour host this node is assigned to keep started.

use super::{ChargeStatus, Supervisable};
use crate::core::{KV_NAMESPACE, MSG_ALREADY_STARTED};

/// Outcome of the most recent start action for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// No start has been attempted yet.
    Unknown,
    Started,
    StartFailed,
}

impl ChargeStatus for HostStatus {
    fn unknown() -> Self {
        Self::Unknown
    }

    fn from_outcome(success: bool) -> Self {
        if success { Self::Started } else { Self::StartFailed }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Started => "started",
            Self::StartFailed => "start-failed",
        }
    }
}

/// `Supervisable` charge for one watched neighbour host.
pub struct HostCharge {
    hostname: String,
}

impl HostCharge {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }
}

impl Supervisable for HostCharge {
    type Status = HostStatus;

    fn name(&self) -> &str {
        &self.hostname
    }

    fn kind(&self) -> &'static str {
        "host"
    }

    fn lock_key(&self) -> String {
        format!("{KV_NAMESPACE}/hosts/{}/lock", self.hostname)
    }

    fn config_key(&self) -> String {
        format!("{KV_NAMESPACE}/hosts/{}/config", self.hostname)
    }

    fn action_args(&self) -> Vec<String> {
        vec![
            "host".to_string(),
            "start".to_string(),
            self.hostname.clone(),
        ]
    }

    fn already_ok_marker(&self) -> &'static str {
        MSG_ALREADY_STARTED
    }
}

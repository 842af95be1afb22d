// src/core/agent/service.rs

//! The service charge: one locally hosted placement of a mountable target.

use super::{ChargeStatus, Supervisable};
use crate::core::{KV_NAMESPACE, MSG_ALREADY_MOUNTED};

/// Outcome of the most recent mount action for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// No mount has been attempted yet.
    Unknown,
    Mounted,
    MountFailed,
}

impl ChargeStatus for ServiceStatus {
    fn unknown() -> Self {
        Self::Unknown
    }

    fn from_outcome(success: bool) -> Self {
        if success { Self::Mounted } else { Self::MountFailed }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Mounted => "mounted",
            Self::MountFailed => "mount-failed",
        }
    }
}

/// `Supervisable` charge for one local service instance.
pub struct ServiceCharge {
    service_name: String,
}

impl ServiceCharge {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

impl Supervisable for ServiceCharge {
    type Status = ServiceStatus;

    fn name(&self) -> &str {
        &self.service_name
    }

    fn kind(&self) -> &'static str {
        "service"
    }

    fn lock_key(&self) -> String {
        format!("{KV_NAMESPACE}/services/{}/lock", self.service_name)
    }

    fn config_key(&self) -> String {
        format!("{KV_NAMESPACE}/services/{}/config", self.service_name)
    }

    fn action_args(&self) -> Vec<String> {
        vec![
            "service".to_string(),
            "mount".to_string(),
            self.service_name.clone(),
        ]
    }

    fn already_ok_marker(&self) -> &'static str {
        MSG_ALREADY_MOUNTED
    }
}

// src/core/errors.rs

//! Defines the primary error type for the agent.

use thiserror::Error;

/// The main error enum, covering every failure the agent distinguishes.
/// Coordinator transport problems collapse into [`AgentError::Unreachable`]
/// after internal retries; nothing is fatal once the agents are running.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The topology cannot be loaded or is invalid. Raised only during
    /// startup, before any agent task exists, and terminates the process.
    #[error("Fatal config error: {0}")]
    FatalConfig(String),

    /// The coordinator did not answer after the stated retries.
    #[error("Coordinator unreachable: {0}")]
    Unreachable(String),

    /// The shared cancellation channel fired while waiting.
    #[error("Cancelled by shutdown")]
    Cancelled,

    /// A value read from the coordinator KV did not parse.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The management CLI could not be spawned at all. A command that spawns
    /// but exits non-zero is not an error; it is a failed action report.
    #[error("Failed to spawn '{command}': {source}")]
    ChildSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        AgentError::Unreachable(e.to_string())
    }
}

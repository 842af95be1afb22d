// src/core/mgr.rs

//! Invocation of the external `lustra` management CLI.
//!
//! The agent never mounts anything itself; every actuation goes through the
//! management tool, whose contract is exit-code based (0 = success) with a
//! handful of well-known stdout markers.

use crate::core::errors::AgentError;
use crate::core::utils::escape_newlines;
#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Handle for running subcommands of the management CLI.
#[derive(Debug, Clone)]
pub struct MgrCommand {
    program: String,
}

/// The captured outcome of one management CLI invocation.
#[derive(Debug, Clone)]
pub struct CommandReport {
    /// The full command line, for log records.
    pub command_line: String,
    /// Whether the child exited with status zero.
    pub success: bool,
    /// Exit code; absent when the child was killed by a signal.
    pub exit_code: Option<i32>,
    /// The signal that killed the child, when there is no exit code.
    pub signal: Option<i32>,
    /// Stdout, decoded lossily from bytes.
    pub stdout: String,
    /// Stderr, decoded lossily from bytes.
    pub stderr: String,
    /// Wall-clock run time of the child.
    pub duration: Duration,
}

impl CommandReport {
    pub fn stdout_escaped(&self) -> String {
        escape_newlines(self.stdout.trim_end())
    }

    pub fn stderr_escaped(&self) -> String {
        escape_newlines(self.stderr.trim_end())
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration.as_secs_f64()
    }

    /// Exit description for log records, covering signal deaths.
    pub fn exit_label(&self) -> String {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code.to_string(),
            (None, Some(signal)) => format!("killed by signal {signal}"),
            (None, None) => "killed by signal".to_string(),
        }
    }
}

impl MgrCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Runs one subcommand to completion, capturing both output streams.
    /// There is no per-command timeout; callers wait for the child to exit.
    pub async fn run(&self, args: &[&str]) -> Result<CommandReport, AgentError> {
        let command_line = std::iter::once(self.program.as_str())
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");

        let started = Instant::now();
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|source| AgentError::ChildSpawn {
                command: command_line.clone(),
                source,
            })?;
        let duration = started.elapsed();

        #[cfg(unix)]
        let signal = output.status.signal();
        #[cfg(not(unix))]
        let signal = None;

        Ok(CommandReport {
            command_line,
            success: output.status.success(),
            exit_code: output.status.code(),
            signal,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration,
        })
    }
}

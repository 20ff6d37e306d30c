//! Captured execution of the OS utilities used to probe, format, and mount
//! the device.
//!
//! Each utility is opaque: the pipeline only interprets its exit status and,
//! for diagnostics, its captured stderr.

use std::ffi::OsString;

use thiserror::Error;
use tokio::process::Command;

use crate::backend::BackendFuture;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Renders the exit status for messages, using `unknown` when the
    /// process was terminated by a signal.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Raised when a utility cannot be started at all.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to spawn {program}: {message}")]
pub struct SpawnError {
    /// Command that failed to start.
    pub program: String,
    /// Operating system error string.
    pub message: String,
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// The future fails with [`SpawnError`] if the command cannot be
    /// started.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> BackendFuture<'a, CommandOutput, SpawnError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> BackendFuture<'a, CommandOutput, SpawnError> {
        Box::pin(async move {
            tracing::debug!(program, ?args, "running utility");
            let output = Command::new(program)
                .args(args)
                .output()
                .await
                .map_err(|err| SpawnError {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

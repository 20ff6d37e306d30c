//! Foreground execution of the caller's command, raced against termination
//! signals.
//!
//! The orchestrator starts listening before it acquires anything and hands
//! the same listener to the launcher. Whichever completes first wins. When a
//! signal arrives first the launcher returns immediately and the child is
//! left to wind down on its own; the caller proceeds straight to cleanup.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::Stdio;

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::process::Command;
use tokio::signal::unix::{SignalKind, signal};

use crate::backend::BackendFuture;

/// Termination signals the runner reacts to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TerminationSignal {
    /// `SIGINT`.
    Interrupt,
    /// `SIGTERM`.
    Terminate,
}

impl TerminationSignal {
    /// POSIX signal number.
    #[must_use]
    pub const fn number(self) -> i32 {
        match self {
            Self::Interrupt => 2,
            Self::Terminate => 15,
        }
    }

    /// Conventional shell exit status for a process stopped by this signal.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        128 + self.number()
    }
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("SIGINT"),
            Self::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Future resolving once a termination signal has been observed.
pub type InterruptFuture = Pin<Box<dyn Future<Output = TerminationSignal> + Send>>;

/// Source of termination signals.
pub trait InterruptSource {
    /// Registers interest in termination signals and returns a future that
    /// resolves on the first one observed.
    ///
    /// # Errors
    ///
    /// Returns the OS error when handlers cannot be installed.
    fn listen(&self) -> io::Result<InterruptFuture>;
}

/// Listens for `SIGINT` and `SIGTERM` on the current process.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsSignals;

impl InterruptSource for OsSignals {
    fn listen(&self) -> io::Result<InterruptFuture> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        Ok(Box::pin(async move {
            tokio::select! {
                _ = interrupt.recv() => TerminationSignal::Interrupt,
                _ = terminate.recv() => TerminationSignal::Terminate,
            }
        }))
    }
}

/// Program plus arguments supplied by the caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandLine {
    /// Executable to launch.
    pub program: String,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
}

impl CommandLine {
    /// Splits `argv` into program and arguments.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Empty`] when `argv` is empty or the program
    /// is blank.
    pub fn new(argv: &[String]) -> Result<Self, CommandError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(CommandError::Empty);
        };
        if program.trim().is_empty() {
            return Err(CommandError::Empty);
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(escape(self.program.as_str().into()).as_ref())?;
        for arg in &self.args {
            f.write_str(" ")?;
            f.write_str(escape(arg.as_str().into()).as_ref())?;
        }
        Ok(())
    }
}

/// How the foreground command finished from the controller's view.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Completion {
    /// The child exited; `code` is `None` when it was killed by a signal.
    Exited {
        /// Exit code reported by the OS.
        code: Option<i32>,
    },
    /// A termination signal arrived before the child exited.
    Interrupted(TerminationSignal),
}

/// Errors raised while launching or awaiting the command.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// No command was supplied.
    #[error("no command given")]
    Empty,
    /// The command could not be started.
    #[error("failed to start {program}: {message}")]
    SpawnFailed {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Signal handlers could not be installed.
    #[error("cannot listen for termination signals: {message}")]
    Signals {
        /// Operating system error string.
        message: String,
    },
    /// Waiting for the child failed.
    #[error("failed waiting for {program}: {message}")]
    Wait {
        /// Program being awaited.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Launches the caller's command in the foreground.
pub trait ChildLauncher {
    /// Runs `command` to completion or until `interrupted` resolves.
    fn launch<'a>(
        &'a self,
        command: &'a CommandLine,
        interrupted: &'a mut InterruptFuture,
    ) -> BackendFuture<'a, Completion, CommandError>;
}

/// Launcher wiring the child to the caller's stdio.
#[derive(Clone, Copy, Debug, Default)]
pub struct GuardedCommandRunner;

impl ChildLauncher for GuardedCommandRunner {
    fn launch<'a>(
        &'a self,
        command: &'a CommandLine,
        interrupted: &'a mut InterruptFuture,
    ) -> BackendFuture<'a, Completion, CommandError> {
        Box::pin(async move {
            tracing::info!(%command, "invoking command");
            let mut child = Command::new(&command.program)
                .args(&command.args)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|err| CommandError::SpawnFailed {
                    program: command.program.clone(),
                    message: err.to_string(),
                })?;

            tokio::select! {
                status = child.wait() => {
                    let exit = status.map_err(|err| CommandError::Wait {
                        program: command.program.clone(),
                        message: err.to_string(),
                    })?;
                    tracing::debug!(code = ?exit.code(), "command exited");
                    Ok(Completion::Exited { code: exit.code() })
                }
                received = interrupted.as_mut() => {
                    tracing::warn!(signal = %received, "termination signal received, cleaning up");
                    Ok(Completion::Interrupted(received))
                }
            }
        })
    }
}

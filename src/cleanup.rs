//! Reverse-order release of acquired resources.
//!
//! Each successful acquisition pushes its teardown action. A single unwind
//! pops and runs them last-in first-out, so the mount is always released
//! before the attachment. Popping consumes the action, which keeps every
//! release to exactly one attempt no matter which exit path triggers it.

use std::fmt;

use crate::attach::Attachment;
use crate::mount::MountTarget;

/// A pending release step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Teardown {
    /// Unmount the target.
    Unmount(MountTarget),
    /// Detach the volume.
    Detach(Attachment),
}

impl Teardown {
    /// Step kind, for reporting.
    #[must_use]
    pub const fn step(&self) -> TeardownStep {
        match self {
            Self::Unmount(_) => TeardownStep::Unmount,
            Self::Detach(_) => TeardownStep::Detach,
        }
    }
}

/// Kind of release step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TeardownStep {
    /// Unmount.
    Unmount,
    /// Detach.
    Detach,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmount => f.write_str("unmount"),
            Self::Detach => f.write_str("detach"),
        }
    }
}

/// LIFO stack of pending teardown actions.
#[derive(Debug, Default)]
pub struct CleanupStack {
    actions: Vec<Teardown>,
}

impl CleanupStack {
    /// Creates an empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Registers the release for a resource that was just acquired.
    pub fn push(&mut self, action: Teardown) {
        tracing::debug!(step = %action.step(), "registered teardown");
        self.actions.push(action);
    }

    /// Takes the most recently registered action.
    pub fn pop(&mut self) -> Option<Teardown> {
        self.actions.pop()
    }

    /// Returns `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Pending steps in the order they would run.
    #[must_use]
    pub fn pending_steps(&self) -> Vec<TeardownStep> {
        self.actions.iter().rev().map(Teardown::step).collect()
    }

    /// Hands the acquired resources over to the caller without releasing
    /// them (mount-only mode).
    pub fn disarm(&mut self) -> Vec<Teardown> {
        std::mem::take(&mut self.actions)
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            tracing::error!(
                pending = ?self.pending_steps(),
                "cleanup stack dropped with unreleased resources"
            );
        }
    }
}

/// Outcome of one executed teardown step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TeardownRecord {
    /// Step that ran.
    pub step: TeardownStep,
    /// Failure message, when the step failed.
    pub failure: Option<String>,
}

/// Everything the unwind did, in execution order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CleanupReport {
    /// Executed steps.
    pub records: Vec<TeardownRecord>,
}

impl CleanupReport {
    /// Records a successful step.
    pub fn succeeded(&mut self, step: TeardownStep) {
        self.records.push(TeardownRecord {
            step,
            failure: None,
        });
    }

    /// Records and logs a failed step. Teardown failures never escalate.
    pub fn failed(&mut self, step: TeardownStep, message: impl Into<String>) {
        let text = message.into();
        tracing::warn!(%step, error = %text, "cleanup step failed");
        self.records.push(TeardownRecord {
            step,
            failure: Some(text),
        });
    }

    /// Steps in the order they ran.
    #[must_use]
    pub fn steps(&self) -> Vec<TeardownStep> {
        self.records.iter().map(|record| record.step).collect()
    }

    /// Number of failed steps.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.failure.is_some())
            .count()
    }
}

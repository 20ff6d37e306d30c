//! Test support utilities shared across unit and integration tests.
//!
//! Every fake here can share one [`Journal`], so a test observes the side
//! effects of the cloud API, the OS utilities and the child command as a
//! single ordered sequence.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use camino::Utf8Path;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::backend::{BackendFuture, VolumeBackend, VolumeHandle};
use crate::device::{DeviceProbe, DeviceSlot};
use crate::guard::{
    ChildLauncher, CommandError, CommandLine, Completion, InterruptFuture, InterruptSource,
    TerminationSignal,
};
use crate::identity::InstanceIdentity;
use crate::process::{CommandOutput, CommandRunner, SpawnError};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A side effect observed by one of the fakes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// Remote attach request.
    Attach {
        /// Volume requested.
        volume_id: String,
        /// Instance the volume was attached to.
        instance_id: String,
        /// Platform-facing device name.
        platform_name: String,
    },
    /// Remote detach request.
    Detach {
        /// Volume released.
        volume_id: String,
        /// Instance the volume was detached from.
        instance_id: String,
    },
    /// OS utility invocation (probe, format, mount, unmount).
    Utility(CommandInvocation),
    /// Launch of the caller's command.
    Run {
        /// Shell-escaped command line.
        command: String,
    },
}

impl Event {
    /// Short label used in ordering assertions: `attach`, `detach`, `run`,
    /// or the utility's file name (`blkid`, `mkfs.ext4`, `mount`, `umount`).
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Attach { .. } => String::from("attach"),
            Self::Detach { .. } => String::from("detach"),
            Self::Utility(invocation) => invocation.program_name().to_owned(),
            Self::Run { .. } => String::from("run"),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attach {
                volume_id,
                instance_id,
                platform_name,
            } => write!(f, "attach {volume_id} {instance_id} {platform_name}"),
            Self::Detach {
                volume_id,
                instance_id,
            } => write!(f, "detach {volume_id} {instance_id}"),
            Self::Utility(invocation) => f.write_str(&invocation.command_string()),
            Self::Run { command } => write!(f, "run {command}"),
        }
    }
}

/// Shared, ordered record of side effects.
#[derive(Clone, Debug, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Journal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event.
    pub fn record(&self, event: Event) {
        lock(&self.events).push(event);
    }

    /// Snapshot of every event so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    /// Labels of every event so far, in order.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        lock(&self.events).iter().map(Event::label).collect()
    }
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    /// File name of the program, without any leading directories.
    #[must_use]
    pub fn program_name(&self) -> &str {
        Utf8Path::new(&self.program)
            .file_name()
            .unwrap_or(&self.program)
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Once the queue is drained the runner answers with the fallback output,
/// if one is set, and otherwise fails as if the program could not start.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    journal: Journal,
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    fallback: Arc<Mutex<Option<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

impl ScriptedRunner {
    /// Creates a runner recording into `journal` with no queued responses.
    #[must_use]
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    /// Answers every unscripted invocation with a successful exit.
    #[must_use]
    pub fn succeeding_by_default(self) -> Self {
        *lock(&self.fallback) = Some(output(Some(0), ""));
        self
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push(output(Some(0), ""));
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push(output(Some(code), ""));
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push(output(Some(code), "simulated failure"));
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push(output(None, ""));
    }

    fn push(&self, response: CommandOutput) {
        lock(&self.responses).push_back(response);
    }
}

fn output(code: Option<i32>, stderr: &str) -> CommandOutput {
    CommandOutput {
        code,
        stdout: String::new(),
        stderr: stderr.to_owned(),
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> BackendFuture<'a, CommandOutput, SpawnError> {
        let invocation = CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        };
        lock(&self.invocations).push(invocation.clone());
        self.journal.record(Event::Utility(invocation));

        let scripted = lock(&self.responses).pop_front();
        let response = scripted
            .or_else(|| lock(&self.fallback).clone())
            .ok_or_else(|| SpawnError {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            });
        Box::pin(std::future::ready(response))
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    present: BTreeSet<String>,
    denied: BTreeSet<String>,
    pending: BTreeMap<String, usize>,
    checks: usize,
}

/// In-memory device namespace.
///
/// Clones share state, so a probe handed to the orchestrator can still be
/// scripted by the test (or by [`RecordingBackend`]) afterwards.
#[derive(Clone, Debug, Default)]
pub struct ScriptedDeviceProbe {
    state: Arc<Mutex<ProbeState>>,
}

impl ScriptedDeviceProbe {
    /// Creates an empty namespace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `path` as present.
    pub fn add_device(&self, path: &str) {
        lock(&self.state).present.insert(path.to_owned());
    }

    /// Makes checks of `path` fail with `PermissionDenied`.
    pub fn fail_with_permission_denied(&self, path: &str) {
        lock(&self.state).denied.insert(path.to_owned());
    }

    /// Makes `path` appear once it has been reported absent `polls` times.
    pub fn appear_after(&self, path: &str, polls: usize) {
        lock(&self.state).pending.insert(path.to_owned(), polls);
    }

    /// Number of existence checks performed.
    #[must_use]
    pub fn checks(&self) -> usize {
        lock(&self.state).checks
    }
}

impl DeviceProbe for ScriptedDeviceProbe {
    fn exists(&self, path: &Utf8Path) -> io::Result<bool> {
        let mut state = lock(&self.state);
        state.checks += 1;
        let key = path.as_str();
        if state.denied.contains(key) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        if state.present.contains(key) {
            return Ok(true);
        }
        match state.pending.get_mut(key) {
            Some(0) => {
                state.pending.remove(key);
                state.present.insert(key.to_owned());
                Ok(true)
            }
            Some(remaining) => {
                *remaining -= 1;
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

/// Errors produced by [`RecordingBackend`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RecordingBackendError {
    /// Attach was scripted to fail.
    #[error("simulated attach failure for {volume_id}")]
    AttachRejected {
        /// Volume requested.
        volume_id: String,
    },
    /// Detach was scripted to fail.
    #[error("simulated detach failure for {volume_id}")]
    DetachRejected {
        /// Volume requested.
        volume_id: String,
    },
}

#[derive(Debug, Default)]
struct BackendState {
    fail_attach: bool,
    fail_detach: bool,
    materialize: Option<(ScriptedDeviceProbe, usize)>,
    attach_calls: usize,
    detach_calls: usize,
}

/// Volume backend that records calls and can be scripted to fail.
#[derive(Clone, Debug, Default)]
pub struct RecordingBackend {
    journal: Journal,
    state: Arc<Mutex<BackendState>>,
}

impl RecordingBackend {
    /// Creates a backend recording into `journal`.
    #[must_use]
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            state: Arc::default(),
        }
    }

    /// Rejects every attach request.
    pub fn fail_on_attach(&self) {
        lock(&self.state).fail_attach = true;
    }

    /// Rejects every detach request.
    pub fn fail_on_detach(&self) {
        lock(&self.state).fail_detach = true;
    }

    /// After each accepted attach, makes the slot's OS path appear in
    /// `probe` once it has been polled `polls` times.
    pub fn materialize_devices(&self, probe: &ScriptedDeviceProbe, polls: usize) {
        lock(&self.state).materialize = Some((probe.clone(), polls));
    }

    /// Number of attach requests received.
    #[must_use]
    pub fn attach_calls(&self) -> usize {
        lock(&self.state).attach_calls
    }

    /// Number of detach requests received.
    #[must_use]
    pub fn detach_calls(&self) -> usize {
        lock(&self.state).detach_calls
    }
}

impl VolumeBackend for RecordingBackend {
    type Error = RecordingBackendError;

    fn attach<'a>(
        &'a self,
        volume: &'a VolumeHandle,
        identity: &'a InstanceIdentity,
        slot: &'a DeviceSlot,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.journal.record(Event::Attach {
                volume_id: volume.id().to_owned(),
                instance_id: identity.instance_id().to_owned(),
                platform_name: slot.platform_name.clone(),
            });
            let mut state = lock(&self.state);
            state.attach_calls += 1;
            if state.fail_attach {
                return Err(RecordingBackendError::AttachRejected {
                    volume_id: volume.id().to_owned(),
                });
            }
            if let Some((probe, polls)) = &state.materialize {
                probe.appear_after(slot.os_path.as_str(), *polls);
            }
            Ok(())
        })
    }

    fn detach<'a>(
        &'a self,
        volume: &'a VolumeHandle,
        identity: &'a InstanceIdentity,
        _slot: Option<&'a DeviceSlot>,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            self.journal.record(Event::Detach {
                volume_id: volume.id().to_owned(),
                instance_id: identity.instance_id().to_owned(),
            });
            let mut state = lock(&self.state);
            state.detach_calls += 1;
            if state.fail_detach {
                return Err(RecordingBackendError::DetachRejected {
                    volume_id: volume.id().to_owned(),
                });
            }
            Ok(())
        })
    }
}

/// Interrupt source that fires a scripted signal, or never.
#[derive(Clone, Copy, Debug)]
pub struct ScriptedInterrupts {
    script: Option<(TerminationSignal, Duration)>,
}

impl ScriptedInterrupts {
    /// Never delivers a signal.
    #[must_use]
    pub const fn never() -> Self {
        Self { script: None }
    }

    /// Delivers `signal` once `delay` has elapsed after listening starts.
    #[must_use]
    pub const fn after(signal: TerminationSignal, delay: Duration) -> Self {
        Self {
            script: Some((signal, delay)),
        }
    }

    /// Delivers `signal` as soon as listening starts.
    #[must_use]
    pub const fn immediately(signal: TerminationSignal) -> Self {
        Self::after(signal, Duration::ZERO)
    }
}

impl InterruptSource for ScriptedInterrupts {
    fn listen(&self) -> io::Result<InterruptFuture> {
        let script = self.script;
        Ok(Box::pin(async move {
            match script {
                Some((signal, delay)) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    signal
                }
                None => std::future::pending().await,
            }
        }))
    }
}

/// Launcher that never spawns anything and returns a scripted completion.
#[derive(Clone, Debug)]
pub struct ScriptedLauncher {
    journal: Journal,
    completion: Result<Completion, CommandError>,
}

impl ScriptedLauncher {
    /// The command exits with `code`.
    #[must_use]
    pub const fn exiting(journal: Journal, code: i32) -> Self {
        Self {
            journal,
            completion: Ok(Completion::Exited { code: Some(code) }),
        }
    }

    /// A termination signal arrives while the command runs.
    #[must_use]
    pub const fn interrupted(journal: Journal, signal: TerminationSignal) -> Self {
        Self {
            journal,
            completion: Ok(Completion::Interrupted(signal)),
        }
    }

    /// The command cannot be started.
    #[must_use]
    pub fn failing_to_spawn(journal: Journal) -> Self {
        Self {
            journal,
            completion: Err(CommandError::SpawnFailed {
                program: String::from("scripted"),
                message: String::from("simulated spawn failure"),
            }),
        }
    }
}

impl ChildLauncher for ScriptedLauncher {
    fn launch<'a>(
        &'a self,
        command: &'a CommandLine,
        _interrupted: &'a mut InterruptFuture,
    ) -> BackendFuture<'a, Completion, CommandError> {
        if self.completion.is_ok() {
            self.journal.record(Event::Run {
                command: command.to_string(),
            });
        }
        Box::pin(std::future::ready(self.completion.clone()))
    }
}

/// Wraps a real launcher and journals each launch.
#[derive(Clone, Debug)]
pub struct JournalingLauncher<L> {
    journal: Journal,
    inner: L,
}

impl<L> JournalingLauncher<L> {
    /// Wraps `inner`, recording into `journal`.
    #[must_use]
    pub const fn new(journal: Journal, inner: L) -> Self {
        Self { journal, inner }
    }
}

impl<L: ChildLauncher> ChildLauncher for JournalingLauncher<L> {
    fn launch<'a>(
        &'a self,
        command: &'a CommandLine,
        interrupted: &'a mut InterruptFuture,
    ) -> BackendFuture<'a, Completion, CommandError> {
        self.journal.record(Event::Run {
            command: command.to_string(),
        });
        self.inner.launch(command, interrupted)
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets a single environment variable while holding the global mutex.
    pub async fn set_var(key: &str, value: &str) -> Self {
        Self::set_vars(&[(key, value)]).await
    }

    /// Sets multiple environment variables while holding the global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

//! Orchestrates the acquire, use, release pipeline.
//!
//! Acquisition runs strictly in sequence: allocate a device slot, attach
//! the volume and wait for the device, ensure a filesystem, mount it. Every
//! successful acquisition registers its release on a [`CleanupStack`];
//! whatever happens afterwards (a later acquisition failing, the command
//! exiting, a termination signal) the stack is unwound once, in reverse.
//! Teardown failures are logged and reported but never replace the error
//! that ended the run.
//!
//! Termination signals are intercepted from the moment acquisition starts.
//! The device wait and the child are abandoned as soon as one arrives; a
//! utility already running is allowed to finish first.

use std::future::Future;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use thiserror::Error;

use crate::attach::{
    AttachError, Attachment, DEFAULT_ATTACH_TIMEOUT, DEFAULT_POLL_INTERVAL, VolumeAttacher,
};
use crate::backend::{VolumeBackend, VolumeHandle};
use crate::cleanup::{CleanupReport, CleanupStack, Teardown, TeardownStep};
use crate::device::{DeviceAllocator, DeviceError, DeviceNaming, DeviceProbe, DeviceSlot};
use crate::filesystem::{
    DEFAULT_FS_TYPE, FilesystemError, FilesystemProvisioner, FilesystemStatus, FilesystemTools,
};
use crate::guard::{
    ChildLauncher, CommandError, CommandLine, Completion, InterruptFuture, InterruptSource,
    TerminationSignal,
};
use crate::identity::{IdentityError, IdentitySource, InstanceIdentity};
use crate::mount::{MountError, MountManager, MountTarget, MountTools};
use crate::process::CommandRunner;

/// Immutable settings for one invocation, passed to every component.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunSettings {
    /// Volume to provision.
    pub volume: VolumeHandle,
    /// Mount point and filesystem type.
    pub mount: MountTarget,
    /// Time allowed for the device to appear.
    pub attach_timeout: Duration,
    /// Interval between device checks.
    pub poll_interval: Duration,
    /// Device slot naming.
    pub naming: DeviceNaming,
    /// Probe/format utilities.
    pub filesystem_tools: FilesystemTools,
    /// Mount/unmount utilities.
    pub mount_tools: MountTools,
}

impl RunSettings {
    /// Settings with defaults for everything but the volume.
    #[must_use]
    pub fn new(volume: VolumeHandle) -> Self {
        let mount = MountTarget {
            path: MountTarget::default_path(volume.id()),
            filesystem_type: DEFAULT_FS_TYPE.to_owned(),
        };
        Self {
            volume,
            mount,
            attach_timeout: DEFAULT_ATTACH_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            naming: DeviceNaming::default(),
            filesystem_tools: FilesystemTools::default(),
            mount_tools: MountTools::default(),
        }
    }
}

/// Errors that end a run. Each is the first fatal failure observed.
#[derive(Debug, Error)]
pub enum RunError<BackendError>
where
    BackendError: std::error::Error + 'static,
{
    /// The instance identity could not be resolved.
    #[error(transparent)]
    IdentityUnresolved(#[from] IdentityError),
    /// No device slot was free.
    #[error(transparent)]
    NoFreeSlot(#[from] DeviceError),
    /// Attach was rejected, timed out, or the device check failed.
    #[error(transparent)]
    Attach(#[from] AttachError<BackendError>),
    /// Probing or formatting the device failed.
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
    /// Mounting (or, in unmount-only mode, unmounting) failed.
    #[error(transparent)]
    Mount(#[from] MountError),
    /// Detach failed in unmount-only mode.
    #[error("failed to detach {volume_id}: {source}")]
    DetachFailed {
        /// Volume being detached.
        volume_id: String,
        /// Provider error.
        #[source]
        source: BackendError,
    },
    /// The command could not be launched or awaited.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// The command exited unsuccessfully.
    #[error("command failed with {}", exit_text(.code))]
    CommandFailed {
        /// Exit code, `None` when the child was killed by a signal.
        code: Option<i32>,
    },
    /// A termination signal arrived while the command was running.
    #[error("interrupted by {signal}")]
    Interrupted {
        /// Signal observed.
        signal: TerminationSignal,
    },
}

impl<BackendError> RunError<BackendError>
where
    BackendError: std::error::Error + 'static,
{
    /// Process exit code that reflects this failure: the child's own status
    /// when it failed, `128 + signal` when interrupted, otherwise 1.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CommandFailed { code: Some(code) } if *code != 0 => *code,
            Self::Interrupted { signal } => signal.exit_code(),
            _ => 1,
        }
    }
}

fn exit_text(code: &Option<i32>) -> String {
    code.map_or_else(
        || String::from("no exit status (killed by a signal)"),
        |value| format!("exit status {value}"),
    )
}

/// What a completed acquisition produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunSummary {
    /// Slot the volume was attached at.
    pub slot: DeviceSlot,
    /// Whether a filesystem had to be created.
    pub filesystem: FilesystemStatus,
    /// Teardown steps executed after the command.
    pub cleanup: CleanupReport,
}

/// Executes the provisioning pipeline.
#[derive(Debug)]
pub struct RunOrchestrator<B, R, P, L, I> {
    settings: RunSettings,
    allocator: DeviceAllocator<P>,
    attacher: VolumeAttacher<B, P>,
    filesystem: FilesystemProvisioner<R>,
    mounts: MountManager<R>,
    launcher: L,
    interrupts: I,
}

impl<B, R, P, L, I> RunOrchestrator<B, R, P, L, I>
where
    B: VolumeBackend,
    R: CommandRunner + Clone,
    P: DeviceProbe + Clone,
    L: ChildLauncher,
    I: InterruptSource,
{
    /// Wires the components from `settings` and the collaborators.
    #[must_use]
    pub fn new(
        settings: RunSettings,
        backend: B,
        runner: R,
        probe: P,
        launcher: L,
        interrupts: I,
    ) -> Self {
        let allocator = DeviceAllocator::new(settings.naming.clone(), probe.clone());
        let attacher = VolumeAttacher::new(backend, probe)
            .with_timeout(settings.attach_timeout)
            .with_poll_interval(settings.poll_interval);
        let filesystem = FilesystemProvisioner::new(settings.filesystem_tools.clone(), runner.clone());
        let mounts = MountManager::new(settings.mount_tools.clone(), runner);
        Self {
            settings,
            allocator,
            attacher,
            filesystem,
            mounts,
            launcher,
            interrupts,
        }
    }

    /// Settings this orchestrator was built with.
    #[must_use]
    pub const fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Provisions the volume, runs `command` with it mounted, and releases
    /// everything afterwards.
    ///
    /// Cleanup runs whether acquisition fails part way, the command fails,
    /// or a termination signal arrives.
    ///
    /// # Errors
    ///
    /// Returns the first fatal [`RunError`]; a non-zero command exit is
    /// reported as [`RunError::CommandFailed`].
    pub async fn execute<S>(
        &self,
        identity_source: &S,
        command: &CommandLine,
    ) -> Result<RunSummary, RunError<B::Error>>
    where
        S: IdentitySource + ?Sized,
    {
        let identity = identity_source.resolve().await?;
        let mut interrupted = self.listen()?;
        let mut cleanup = CleanupStack::new();
        let outcome = self
            .acquire_and_run(&identity, command, &mut cleanup, &mut interrupted)
            .await;
        let report = self.unwind(&mut cleanup).await;
        let (slot, filesystem) = outcome?;
        Ok(RunSummary {
            slot,
            filesystem,
            cleanup: report,
        })
    }

    /// Provisions and mounts the volume, then leaves it in place.
    ///
    /// A failure part way still rolls back whatever was acquired.
    ///
    /// # Errors
    ///
    /// Returns the first acquisition failure.
    pub async fn mount_only<S>(
        &self,
        identity_source: &S,
    ) -> Result<RunSummary, RunError<B::Error>>
    where
        S: IdentitySource + ?Sized,
    {
        let identity = identity_source.resolve().await?;
        let mut interrupted = self.listen()?;
        let mut cleanup = CleanupStack::new();
        match self.acquire(&identity, &mut cleanup, &mut interrupted).await {
            Ok((slot, filesystem)) => {
                let kept = cleanup.disarm();
                tracing::info!(
                    path = %self.settings.mount.path,
                    resources = kept.len(),
                    "volume left mounted"
                );
                Ok(RunSummary {
                    slot,
                    filesystem,
                    cleanup: CleanupReport::default(),
                })
            }
            Err(err) => {
                self.unwind(&mut cleanup).await;
                Err(err)
            }
        }
    }

    /// Releases a volume mounted by an earlier `mount_only` invocation:
    /// unmount, then detach. Both steps are attempted.
    ///
    /// # Errors
    ///
    /// Returns the unmount failure if there was one, otherwise the detach
    /// failure.
    pub async fn unmount_only<S>(
        &self,
        identity_source: &S,
    ) -> Result<CleanupReport, RunError<B::Error>>
    where
        S: IdentitySource + ?Sized,
    {
        let identity = identity_source.resolve().await?;
        // Signals are held off until both releases have been attempted.
        let _held = self.listen()?;
        let mut report = CleanupReport::default();

        let unmounted = self.mounts.unmount(&self.settings.mount).await;
        match &unmounted {
            Ok(_) => report.succeeded(TeardownStep::Unmount),
            Err(err) => report.failed(TeardownStep::Unmount, err.to_string()),
        }

        let mut attachment = Attachment::existing(self.settings.volume.clone(), identity);
        let detached = self.attacher.detach(&mut attachment).await;
        match &detached {
            Ok(()) => report.succeeded(TeardownStep::Detach),
            Err(err) => report.failed(TeardownStep::Detach, err.to_string()),
        }

        unmounted?;
        detached.map_err(|source| RunError::DetachFailed {
            volume_id: self.settings.volume.id().to_owned(),
            source,
        })?;
        Ok(report)
    }

    fn listen(&self) -> Result<InterruptFuture, RunError<B::Error>> {
        self.interrupts.listen().map_err(|err| {
            RunError::Command(CommandError::Signals {
                message: err.to_string(),
            })
        })
    }

    async fn acquire(
        &self,
        identity: &InstanceIdentity,
        cleanup: &mut CleanupStack,
        interrupted: &mut InterruptFuture,
    ) -> Result<(DeviceSlot, FilesystemStatus), RunError<B::Error>> {
        let slot = self.allocator.allocate()?;

        let mut attachment =
            Attachment::new(self.settings.volume.clone(), identity.clone(), slot.clone());
        self.attacher.request_attach(&mut attachment).await?;
        // The control plane may consider the volume attached even when the
        // device never shows up, so detach is registered before the wait
        // result is inspected.
        let waited = tokio::select! {
            biased;
            waited = self.attacher.wait_for_device(&mut attachment) => waited.map_err(RunError::from),
            signal = interrupted.as_mut() => Err(RunError::Interrupted { signal }),
        };
        cleanup.push(Teardown::Detach(attachment));
        waited?;

        let target = &self.settings.mount;
        let formatted = self
            .filesystem
            .ensure_filesystem(&slot.os_path, &target.filesystem_type)
            .await;
        pending_signal(interrupted)?;
        let filesystem = formatted?;

        let mounted = self.mounts.mount(&slot.os_path, target).await;
        if mounted.is_ok() {
            cleanup.push(Teardown::Unmount(target.clone()));
        }
        pending_signal(interrupted)?;
        mounted?;

        Ok((slot, filesystem))
    }

    async fn acquire_and_run(
        &self,
        identity: &InstanceIdentity,
        command: &CommandLine,
        cleanup: &mut CleanupStack,
        interrupted: &mut InterruptFuture,
    ) -> Result<(DeviceSlot, FilesystemStatus), RunError<B::Error>> {
        let acquired = self.acquire(identity, cleanup, interrupted).await?;
        match self.launcher.launch(command, interrupted).await? {
            Completion::Exited { code: Some(0) } => Ok(acquired),
            Completion::Exited { code } => Err(RunError::CommandFailed { code }),
            Completion::Interrupted(signal) => Err(RunError::Interrupted { signal }),
        }
    }

    async fn unwind(&self, cleanup: &mut CleanupStack) -> CleanupReport {
        let mut report = CleanupReport::default();
        while let Some(action) = cleanup.pop() {
            let step = action.step();
            match action {
                Teardown::Unmount(target) => match self.mounts.unmount(&target).await {
                    Ok(_) => report.succeeded(step),
                    Err(err) => report.failed(step, err.to_string()),
                },
                Teardown::Detach(mut attachment) => {
                    match self.attacher.detach(&mut attachment).await {
                        Ok(()) => report.succeeded(step),
                        Err(err) => report.failed(step, err.to_string()),
                    }
                }
            }
        }
        report
    }
}

/// Returns the signal if one has already been observed, without waiting.
fn pending_signal<E>(interrupted: &mut InterruptFuture) -> Result<(), RunError<E>>
where
    E: std::error::Error + 'static,
{
    let mut cx = Context::from_waker(Waker::noop());
    match interrupted.as_mut().poll(&mut cx) {
        Poll::Ready(signal) => {
            tracing::warn!(%signal, "termination signal received, cleaning up");
            Err(RunError::Interrupted { signal })
        }
        Poll::Pending => Ok(()),
    }
}

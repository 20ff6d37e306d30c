//! Core library for the `withvol` volume provisioning tool.
//!
//! A run attaches a block volume to the current instance, ensures it
//! carries a filesystem, mounts it, runs one command, and then releases
//! everything in reverse order. Each collaborator (the cloud API, the
//! device namespace, the OS utilities, the child process) sits behind a
//! trait so the pipeline in [`run`] can be exercised with the fakes in
//! [`test_support`].

pub mod attach;
pub mod backend;
pub mod cleanup;
pub mod config;
pub mod device;
pub mod filesystem;
pub mod guard;
pub mod identity;
pub mod mount;
pub mod process;
pub mod run;
pub mod scaleway;
pub mod test_support;

pub use attach::{AttachError, Attachment, AttachmentState, VolumeAttacher};
pub use backend::{BackendError, BackendFuture, VolumeBackend, VolumeHandle};
pub use cleanup::{CleanupReport, CleanupStack, Teardown, TeardownStep};
pub use config::{ConfigError, ConfigOverrides, ScalewayConfig, VolumeConfig};
pub use device::{DeviceAllocator, DeviceError, DeviceNaming, DeviceProbe, DeviceSlot, FsDeviceProbe};
pub use filesystem::{FilesystemError, FilesystemProvisioner, FilesystemStatus, FilesystemTools};
pub use guard::{
    ChildLauncher, CommandError, CommandLine, Completion, GuardedCommandRunner, InterruptSource,
    OsSignals, TerminationSignal,
};
pub use identity::{
    IdentityError, IdentitySource, InstanceIdentity, MetadataIdentitySource, StaticIdentitySource,
};
pub use mount::{MountError, MountManager, MountState, MountTarget, MountTools, UnmountOutcome};
pub use process::{CommandOutput, CommandRunner, ProcessCommandRunner, SpawnError};
pub use run::{RunError, RunOrchestrator, RunSettings, RunSummary};
pub use scaleway::{ScalewayBackend, ScalewayBackendError};

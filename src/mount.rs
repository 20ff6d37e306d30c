//! Mount directory creation and mount/unmount sequencing.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::process::CommandRunner;

/// `umount` status for "not mounted" or "target busy" on util-linux.
pub const DEFAULT_UMOUNT_IDLE_EXIT_CODE: i32 = 32;

/// Root under which default mount points are created.
pub const DEFAULT_MOUNT_ROOT: &str = "/mnt";

/// Where the volume is mounted and which filesystem a blank volume gets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountTarget {
    /// Mount point directory.
    pub path: Utf8PathBuf,
    /// Filesystem type created on blank volumes.
    pub filesystem_type: String,
}

impl MountTarget {
    /// Returns the default mount point for `volume_id`.
    #[must_use]
    pub fn default_path(volume_id: &str) -> Utf8PathBuf {
        Utf8Path::new(DEFAULT_MOUNT_ROOT).join(volume_id)
    }
}

/// Mount lifecycle of the target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MountState {
    /// Nothing is mounted at the target.
    Unmounted,
    /// The device is mounted at the target.
    Mounted,
}

/// Result of a successful unmount call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnmountOutcome {
    /// The filesystem was unmounted.
    Unmounted,
    /// `umount` reported the idle status (not mounted or busy); treated as
    /// a no-op.
    AlreadyIdle,
}

/// Mount and unmount utilities.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountTools {
    /// Mount executable.
    pub mount_bin: String,
    /// Unmount executable.
    pub umount_bin: String,
    /// Unmount exit code treated as success.
    pub umount_idle_exit_code: i32,
}

impl Default for MountTools {
    fn default() -> Self {
        Self {
            mount_bin: String::from("mount"),
            umount_bin: String::from("umount"),
            umount_idle_exit_code: DEFAULT_UMOUNT_IDLE_EXIT_CODE,
        }
    }
}

/// Errors raised while mounting or unmounting.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MountError {
    /// The mount point directory could not be created.
    #[error("cannot create mount point {path}: {message}")]
    CreateDir {
        /// Directory that could not be created.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// `mount` failed or could not be started.
    #[error("cannot mount {device} on {path} (status {status}): {message}")]
    MountFailed {
        /// Device that was mounted.
        device: Utf8PathBuf,
        /// Mount point.
        path: Utf8PathBuf,
        /// Exit status text.
        status: String,
        /// Captured stderr or spawn error.
        message: String,
    },
    /// `umount` failed with a status other than the idle one.
    #[error("failed to unmount {path} (status {status}): {message}")]
    UnmountFailed {
        /// Mount point.
        path: Utf8PathBuf,
        /// Exit status text.
        status: String,
        /// Captured stderr or spawn error.
        message: String,
    },
}

/// Creates mount points and drives the mount utilities.
#[derive(Clone, Debug)]
pub struct MountManager<R> {
    tools: MountTools,
    runner: R,
}

impl<R: CommandRunner> MountManager<R> {
    /// Creates a manager.
    #[must_use]
    pub const fn new(tools: MountTools, runner: R) -> Self {
        Self { tools, runner }
    }

    /// Creates the mount point (recursively) and mounts `device` on it.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::CreateDir`] when the directory cannot be
    /// created and [`MountError::MountFailed`] on any non-zero exit.
    pub async fn mount(&self, device: &Utf8Path, target: &MountTarget) -> Result<MountState, MountError> {
        Dir::create_ambient_dir_all(&target.path, ambient_authority()).map_err(|err| {
            MountError::CreateDir {
                path: target.path.clone(),
                message: err.to_string(),
            }
        })?;

        tracing::info!(%device, path = %target.path, "mounting");
        let args = [
            OsString::from(device.as_str()),
            OsString::from(target.path.as_str()),
        ];
        let failure = |status: String, message: String| MountError::MountFailed {
            device: device.to_path_buf(),
            path: target.path.clone(),
            status,
            message,
        };
        let output = self
            .runner
            .run(&self.tools.mount_bin, &args)
            .await
            .map_err(|err| failure(String::from("not started"), err.to_string()))?;
        if !output.is_success() {
            return Err(failure(output.status_text(), output.stderr));
        }
        Ok(MountState::Mounted)
    }

    /// Unmounts `target`.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::UnmountFailed`] on any exit status other than
    /// success or the configured idle code.
    pub async fn unmount(&self, target: &MountTarget) -> Result<UnmountOutcome, MountError> {
        tracing::info!(path = %target.path, "unmounting");
        let failure = |status: String, message: String| MountError::UnmountFailed {
            path: target.path.clone(),
            status,
            message,
        };
        let args = [OsString::from(target.path.as_str())];
        let output = self
            .runner
            .run(&self.tools.umount_bin, &args)
            .await
            .map_err(|err| failure(String::from("not started"), err.to_string()))?;

        match output.code {
            Some(0) => Ok(UnmountOutcome::Unmounted),
            Some(code) if code == self.tools.umount_idle_exit_code => {
                tracing::debug!(path = %target.path, code, "umount reported idle target");
                Ok(UnmountOutcome::AlreadyIdle)
            }
            _ => Err(failure(output.status_text(), output.stderr)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Journal, ScriptedRunner};
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    struct Workspace {
        target: MountTarget,
        _tmp: TempDir,
    }

    #[fixture]
    fn workspace() -> Workspace {
        let tmp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
        Workspace {
            target: MountTarget {
                path: root.join("nested").join("vol-1"),
                filesystem_type: String::from("ext4"),
            },
            _tmp: tmp,
        }
    }

    fn manager(runner: &ScriptedRunner) -> MountManager<ScriptedRunner> {
        MountManager::new(MountTools::default(), runner.clone())
    }

    #[rstest]
    #[tokio::test]
    async fn mount_creates_directory_and_invokes_mount(workspace: Workspace) {
        let runner = ScriptedRunner::new(Journal::new());
        runner.push_success();

        let state = manager(&runner)
            .mount(Utf8Path::new("/dev/vdb"), &workspace.target)
            .await
            .expect("mount succeeds");

        assert_eq!(state, MountState::Mounted);
        assert!(workspace.target.path.is_dir());
        let invocation = runner.invocations().pop().expect("mount invocation");
        assert_eq!(
            invocation.command_string(),
            format!("mount /dev/vdb {}", workspace.target.path)
        );
    }

    #[rstest]
    #[tokio::test]
    async fn mount_failure_is_fatal(workspace: Workspace) {
        let runner = ScriptedRunner::new(Journal::new());
        runner.push_failure(32);

        let err = manager(&runner)
            .mount(Utf8Path::new("/dev/vdb"), &workspace.target)
            .await
            .expect_err("mount fails");

        assert!(matches!(err, MountError::MountFailed { .. }), "got {err:?}");
    }

    #[rstest]
    #[case(0, UnmountOutcome::Unmounted)]
    #[case(DEFAULT_UMOUNT_IDLE_EXIT_CODE, UnmountOutcome::AlreadyIdle)]
    #[tokio::test]
    async fn unmount_accepts_success_and_idle_status(
        workspace: Workspace,
        #[case] code: i32,
        #[case] expected: UnmountOutcome,
    ) {
        let runner = ScriptedRunner::new(Journal::new());
        runner.push_exit_code(code);

        let outcome = manager(&runner)
            .unmount(&workspace.target)
            .await
            .expect("unmount tolerated");

        assert_eq!(outcome, expected);
    }

    #[rstest]
    #[tokio::test]
    async fn unmount_reports_other_failures(workspace: Workspace) {
        let runner = ScriptedRunner::new(Journal::new());
        runner.push_failure(1);

        let err = manager(&runner)
            .unmount(&workspace.target)
            .await
            .expect_err("status 1 is a failure");

        assert!(
            matches!(err, MountError::UnmountFailed { ref status, .. } if status == "1"),
            "got {err:?}"
        );
    }

    #[test]
    fn default_path_is_derived_from_volume_id() {
        assert_eq!(
            MountTarget::default_path("vol-42"),
            Utf8PathBuf::from("/mnt/vol-42")
        );
    }
}

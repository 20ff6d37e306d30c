//! Idempotent filesystem creation on the attached device.

use std::ffi::OsString;

use camino::Utf8Path;
use thiserror::Error;

use crate::process::{CommandOutput, CommandRunner};

/// Exit status `blkid` uses when it finds no recognisable signature.
pub const DEFAULT_BLANK_EXIT_CODE: i32 = 2;

/// Default filesystem created on blank volumes.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Utilities and exit-status conventions used by the provisioner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilesystemTools {
    /// Probe executable (`blkid`).
    pub probe_bin: String,
    /// Probe exit code meaning "no filesystem present".
    pub blank_exit_code: i32,
    /// Format executable override; `mkfs.<fs_type>` when unset.
    pub mkfs_bin: Option<String>,
}

impl Default for FilesystemTools {
    fn default() -> Self {
        Self {
            probe_bin: String::from("blkid"),
            blank_exit_code: DEFAULT_BLANK_EXIT_CODE,
            mkfs_bin: None,
        }
    }
}

impl FilesystemTools {
    /// Returns the format executable for `fs_type`.
    #[must_use]
    pub fn mkfs_for(&self, fs_type: &str) -> String {
        self.mkfs_bin
            .clone()
            .unwrap_or_else(|| format!("mkfs.{fs_type}"))
    }
}

/// Whether the device already carried a filesystem.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilesystemStatus {
    /// The probe recognised an existing signature.
    Existing,
    /// The volume was blank and a filesystem was created.
    Created,
}

/// Errors raised while preparing the filesystem.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FilesystemError {
    /// The probe failed for a reason other than "blank volume".
    #[error("probing {device} with {program} failed (status {status}): {message}")]
    ProbeFailed {
        /// Device that was probed.
        device: String,
        /// Probe executable.
        program: String,
        /// Exit status text.
        status: String,
        /// Captured stderr or spawn error.
        message: String,
    },
    /// The format utility failed.
    #[error("creating {fs_type} filesystem on {device} failed (status {status}): {message}")]
    FormatFailed {
        /// Device that was formatted.
        device: String,
        /// Requested filesystem type.
        fs_type: String,
        /// Exit status text.
        status: String,
        /// Captured stderr or spawn error.
        message: String,
    },
}

/// Probes a device and formats it when blank.
#[derive(Clone, Debug)]
pub struct FilesystemProvisioner<R> {
    tools: FilesystemTools,
    runner: R,
}

impl<R: CommandRunner> FilesystemProvisioner<R> {
    /// Creates a provisioner.
    #[must_use]
    pub const fn new(tools: FilesystemTools, runner: R) -> Self {
        Self { tools, runner }
    }

    /// Ensures `device` carries a filesystem, creating a `fs_type` one when
    /// the probe reports a blank volume.
    ///
    /// # Errors
    ///
    /// Returns [`FilesystemError::ProbeFailed`] for any probe status other
    /// than success or the configured blank code, and
    /// [`FilesystemError::FormatFailed`] when formatting fails.
    pub async fn ensure_filesystem(
        &self,
        device: &Utf8Path,
        fs_type: &str,
    ) -> Result<FilesystemStatus, FilesystemError> {
        let device_arg = [OsString::from(device.as_str())];
        let probe = self
            .runner
            .run(&self.tools.probe_bin, &device_arg)
            .await
            .map_err(|err| FilesystemError::ProbeFailed {
                device: device.to_string(),
                program: err.program,
                status: String::from("not started"),
                message: err.message,
            })?;

        if probe.is_success() {
            tracing::debug!(%device, "existing filesystem detected");
            return Ok(FilesystemStatus::Existing);
        }
        if probe.code != Some(self.tools.blank_exit_code) {
            return Err(FilesystemError::ProbeFailed {
                device: device.to_string(),
                program: self.tools.probe_bin.clone(),
                status: probe.status_text(),
                message: probe.stderr,
            });
        }

        self.format(device, fs_type).await?;
        Ok(FilesystemStatus::Created)
    }

    async fn format(&self, device: &Utf8Path, fs_type: &str) -> Result<(), FilesystemError> {
        let program = self.tools.mkfs_for(fs_type);
        tracing::info!(%device, fs_type, "creating filesystem");
        let device_arg = [OsString::from(device.as_str())];
        let output = self
            .runner
            .run(&program, &device_arg)
            .await
            .map_err(|err| FilesystemError::FormatFailed {
                device: device.to_string(),
                fs_type: fs_type.to_owned(),
                status: String::from("not started"),
                message: err.to_string(),
            })?;
        check_format(&output, device, fs_type)
    }
}

fn check_format(
    output: &CommandOutput,
    device: &Utf8Path,
    fs_type: &str,
) -> Result<(), FilesystemError> {
    if output.is_success() {
        return Ok(());
    }
    Err(FilesystemError::FormatFailed {
        device: device.to_string(),
        fs_type: fs_type.to_owned(),
        status: output.status_text(),
        message: output.stderr.clone(),
    })
}

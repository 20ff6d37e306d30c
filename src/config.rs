//! Configuration loading via `ortho-config`.
//!
//! Values merge defaults, configuration files (`withvol.toml`), and
//! environment variables. Command-line flags are applied on top through
//! [`VolumeConfig::apply_overrides`], after which the configuration is
//! turned into the immutable [`RunSettings`] shared by every component.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::backend::VolumeHandle;
use crate::device::{
    DEFAULT_MAX_DEVICE_SLOTS, DEFAULT_OS_DEVICE_PREFIX, DEFAULT_PLATFORM_DEVICE_PREFIX,
    DeviceNaming,
};
use crate::filesystem::{DEFAULT_BLANK_EXIT_CODE, DEFAULT_FS_TYPE, FilesystemTools};
use crate::identity::{
    DEFAULT_METADATA_URL, IdentitySource, MetadataIdentitySource, StaticIdentitySource,
};
use crate::mount::{DEFAULT_UMOUNT_IDLE_EXIT_CODE, MountTarget, MountTools};
use crate::run::RunSettings;

const CONFIG_FILE: &str = "withvol.toml";

/// Volume, device, and utility settings for one invocation.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "WITHVOL",
    discovery(
        app_name = "withvol",
        env_var = "WITHVOL_CONFIG_PATH",
        config_file_name = "withvol.toml",
        dotfile_name = ".withvol.toml",
        project_file_name = "withvol.toml"
    )
)]
pub struct VolumeConfig {
    /// Provider identifier of the volume to attach. Required.
    pub volume_id: Option<String>,
    /// Mount point. Defaults to `/mnt/<volume_id>`.
    pub mount_path: Option<String>,
    /// Filesystem created on blank volumes.
    #[ortho_config(default = DEFAULT_FS_TYPE.to_owned())]
    pub fs_type: String,
    /// Seconds to wait for the device after the attach request is accepted.
    #[ortho_config(default = 90)]
    pub attach_timeout_secs: u64,
    /// Milliseconds between device existence checks.
    #[ortho_config(default = 1000)]
    pub attach_poll_interval_ms: u64,
    /// Prefix of the device name sent to the control plane.
    #[ortho_config(default = DEFAULT_PLATFORM_DEVICE_PREFIX.to_owned())]
    pub platform_device_prefix: String,
    /// Prefix of the device path the guest kernel exposes.
    #[ortho_config(default = DEFAULT_OS_DEVICE_PREFIX.to_owned())]
    pub os_device_prefix: String,
    /// Number of device slots to consider.
    #[ortho_config(default = DEFAULT_MAX_DEVICE_SLOTS)]
    pub max_device_slots: usize,
    /// Path to the `blkid` executable.
    #[ortho_config(default = "blkid".to_owned())]
    pub blkid_bin: String,
    /// Probe exit status meaning "no filesystem signature".
    #[ortho_config(default = DEFAULT_BLANK_EXIT_CODE)]
    pub probe_blank_exit_code: i32,
    /// Format executable; `mkfs.<fs_type>` when unset.
    pub mkfs_bin: Option<String>,
    /// Path to the `mount` executable.
    #[ortho_config(default = "mount".to_owned())]
    pub mount_bin: String,
    /// Path to the `umount` executable.
    #[ortho_config(default = "umount".to_owned())]
    pub umount_bin: String,
    /// Unmount exit status treated as an already idle target.
    #[ortho_config(default = DEFAULT_UMOUNT_IDLE_EXIT_CODE)]
    pub umount_idle_exit_code: i32,
}

/// Values supplied on the command line, each replacing the loaded value
/// when present.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConfigOverrides {
    /// `--volume`.
    pub volume_id: Option<String>,
    /// `--mountpoint`.
    pub mount_path: Option<String>,
    /// `--fs`.
    pub fs_type: Option<String>,
    /// `--attach-timeout`.
    pub attach_timeout_secs: Option<u64>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to {CONFIG_FILE}",
            self.description, self.env_var, self.toml_key
        ))
    }
}

fn require_value(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(metadata.missing());
    }
    Ok(())
}

fn require_optional_value(value: Option<&str>, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    match value {
        Some(text) if text.trim().is_empty() => Err(metadata.missing()),
        _ => Ok(()),
    }
}

impl VolumeConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("withvol")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Replaces loaded values with those given on the command line.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            volume_id,
            mount_path,
            fs_type,
            attach_timeout_secs,
        } = overrides;
        if volume_id.is_some() {
            self.volume_id = volume_id;
        }
        if mount_path.is_some() {
            self.mount_path = mount_path;
        }
        if let Some(value) = fs_type {
            self.fs_type = value;
        }
        if let Some(value) = attach_timeout_secs {
            self.attach_timeout_secs = value;
        }
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and the configuration key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required value is blank
    /// and [`ConfigError::Invalid`] when a numeric value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let volume = FieldMetadata::new("volume ID", "WITHVOL_VOLUME_ID", "volume_id");
        match self.volume_id.as_deref() {
            Some(id) => require_value(id, &volume)?,
            None => return Err(volume.missing()),
        }
        require_optional_value(
            self.mount_path.as_deref(),
            &FieldMetadata::new("mount path", "WITHVOL_MOUNT_PATH", "mount_path"),
        )?;
        require_value(
            &self.fs_type,
            &FieldMetadata::new("filesystem type", "WITHVOL_FS_TYPE", "fs_type"),
        )?;
        require_value(
            &self.os_device_prefix,
            &FieldMetadata::new(
                "OS device prefix",
                "WITHVOL_OS_DEVICE_PREFIX",
                "os_device_prefix",
            ),
        )?;
        require_value(
            &self.platform_device_prefix,
            &FieldMetadata::new(
                "platform device prefix",
                "WITHVOL_PLATFORM_DEVICE_PREFIX",
                "platform_device_prefix",
            ),
        )?;
        require_value(
            &self.blkid_bin,
            &FieldMetadata::new("probe executable", "WITHVOL_BLKID_BIN", "blkid_bin"),
        )?;
        require_optional_value(
            self.mkfs_bin.as_deref(),
            &FieldMetadata::new("format executable", "WITHVOL_MKFS_BIN", "mkfs_bin"),
        )?;
        require_value(
            &self.mount_bin,
            &FieldMetadata::new("mount executable", "WITHVOL_MOUNT_BIN", "mount_bin"),
        )?;
        require_value(
            &self.umount_bin,
            &FieldMetadata::new("unmount executable", "WITHVOL_UMOUNT_BIN", "umount_bin"),
        )?;
        if self.max_device_slots == 0 {
            return Err(ConfigError::Invalid {
                field: String::from("max_device_slots"),
                reason: String::from("must be at least 1"),
            });
        }
        if self.attach_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: String::from("attach_poll_interval_ms"),
                reason: String::from("must be at least 1"),
            });
        }
        Ok(())
    }

    /// Validates the configuration and builds the settings for one run.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn to_settings(&self) -> Result<RunSettings, ConfigError> {
        self.validate()?;
        let volume = VolumeHandle::new(self.volume_id.clone().unwrap_or_default())
            .map_err(|err| ConfigError::MissingField(err.to_string()))?;
        let path = self.mount_path.as_deref().map_or_else(
            || MountTarget::default_path(volume.id()),
            |value| Utf8PathBuf::from(value.trim()),
        );
        let fs_type = self.fs_type.trim().to_owned();

        Ok(RunSettings {
            mount: MountTarget {
                path,
                filesystem_type: fs_type,
            },
            attach_timeout: Duration::from_secs(self.attach_timeout_secs),
            poll_interval: Duration::from_millis(self.attach_poll_interval_ms),
            naming: DeviceNaming {
                platform_prefix: self.platform_device_prefix.clone(),
                os_prefix: self.os_device_prefix.clone(),
                max_slots: self.max_device_slots,
            },
            filesystem_tools: FilesystemTools {
                probe_bin: self.blkid_bin.clone(),
                blank_exit_code: self.probe_blank_exit_code,
                mkfs_bin: self.mkfs_bin.clone(),
            },
            mount_tools: MountTools {
                mount_bin: self.mount_bin.clone(),
                umount_bin: self.umount_bin.clone(),
                umount_idle_exit_code: self.umount_idle_exit_code,
            },
            volume,
        })
    }
}

/// Scaleway credentials and instance identity overrides.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Secret key used for authentication. Required for API calls.
    pub secret_key: Option<String>,
    /// Instance metadata endpoint used to discover the local instance.
    #[ortho_config(default = DEFAULT_METADATA_URL.to_owned())]
    pub metadata_url: String,
    /// Instance identifier; bypasses the metadata lookup when set together
    /// with `default_zone`.
    pub instance_id: Option<String>,
    /// Availability zone of the instance.
    pub default_zone: Option<String>,
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("withvol")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Returns the secret key, failing with an actionable message when it
    /// is blank or unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no key is configured.
    pub fn require_secret_key(&self) -> Result<&str, ConfigError> {
        let metadata = FieldMetadata::new("Scaleway API secret key", "SCW_SECRET_KEY", "secret_key");
        let key = self.secret_key.as_deref().ok_or_else(|| metadata.missing())?;
        require_value(key, &metadata)?;
        Ok(key.trim())
    }

    /// Picks the identity source: the configured instance when both
    /// `instance_id` and `default_zone` are set, otherwise the metadata
    /// service.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when an instance ID is
    /// configured without a zone.
    pub fn identity_source(&self) -> Result<Box<dyn IdentitySource>, ConfigError> {
        match (self.instance_id.as_deref(), self.default_zone.as_deref()) {
            (Some(id), Some(zone)) => Ok(Box::new(StaticIdentitySource::new(id, zone))),
            (Some(_), None) => Err(FieldMetadata::new(
                "availability zone for the configured instance",
                "SCW_DEFAULT_ZONE",
                "default_zone",
            )
            .missing()),
            (None, _) => Ok(Box::new(MetadataIdentitySource::new(
                self.metadata_url.clone(),
            ))),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// A value is present but unusable.
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid {
        /// Configuration key.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

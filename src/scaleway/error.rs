//! Error types for the Scaleway backend.

use crate::config::ConfigError;
use scaleway_rs::ScalewayError;
use thiserror::Error;

/// Errors raised by the Scaleway backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayBackendError {
    /// Raised when the high-level configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Wrapper for provider level failures.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the provider SDK.
        message: String,
    },
    /// Raised when a volume cannot be attached to an instance.
    #[error("failed to attach volume {volume_id} to instance {instance_id}: {message}")]
    VolumeAttachmentFailed {
        /// Volume identifier that could not be attached.
        volume_id: String,
        /// Instance identifier.
        instance_id: String,
        /// Error message from the provider.
        message: String,
    },
    /// Raised when a volume cannot be detached from an instance.
    #[error("failed to detach volume {volume_id} from instance {instance_id}: {message}")]
    VolumeDetachFailed {
        /// Volume identifier that could not be detached.
        volume_id: String,
        /// Instance identifier.
        instance_id: String,
        /// Error message from the provider.
        message: String,
    },
    /// Raised when the requested slot already holds another volume.
    #[error("slot {slot} on instance {instance_id} already holds volume {occupant}")]
    SlotOccupied {
        /// Volume map index requested.
        slot: String,
        /// Instance identifier.
        instance_id: String,
        /// Volume currently attached at that index.
        occupant: String,
    },
}

impl From<ScalewayError> for ScalewayBackendError {
    fn from(value: ScalewayError) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}

impl From<ConfigError> for ScalewayBackendError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

//! Remote volume API abstraction.
//!
//! The control plane is treated as a remote service exposing exactly two
//! operations: binding a volume to an instance at a device slot, and
//! unbinding it again. Everything else in the pipeline is local.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::device::DeviceSlot;
use crate::identity::InstanceIdentity;

/// Identifies the remote volume for the duration of one run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeHandle {
    id: String,
}

impl VolumeHandle {
    /// Creates a handle from a provider volume identifier, trimming
    /// surrounding whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when the identifier is blank.
    pub fn new(id: impl Into<String>) -> Result<Self, BackendError> {
        let trimmed = id.into().trim().to_owned();
        if trimmed.is_empty() {
            return Err(BackendError::Validation(String::from("volume_id")));
        }
        Ok(Self { id: trimmed })
    }

    /// Returns the provider volume identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Errors raised by backend-independent request validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Minimal interface implemented by cloud volume backends.
pub trait VolumeBackend {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Asks the control plane to attach `volume` to the instance at `slot`.
    ///
    /// Success only means the request was accepted; the device may take a
    /// while to appear in the guest.
    fn attach<'a>(
        &'a self,
        volume: &'a VolumeHandle,
        identity: &'a InstanceIdentity,
        slot: &'a DeviceSlot,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Asks the control plane to detach `volume` from the instance.
    ///
    /// `slot` is `None` when the caller never allocated one (for example the
    /// standalone unmount mode).
    fn detach<'a>(
        &'a self,
        volume: &'a VolumeHandle,
        identity: &'a InstanceIdentity,
        slot: Option<&'a DeviceSlot>,
    ) -> BackendFuture<'a, (), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("")]
    #[case("   ")]
    fn volume_handle_rejects_blank_ids(#[case] raw: &str) {
        let err = VolumeHandle::new(raw).expect_err("blank id should fail");
        assert_eq!(err, BackendError::Validation(String::from("volume_id")));
    }

    #[test]
    fn volume_handle_trims_whitespace() {
        let handle = VolumeHandle::new("  vol-123 ").expect("valid id");
        assert_eq!(handle.id(), "vol-123");
    }
}

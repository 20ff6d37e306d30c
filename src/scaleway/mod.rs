//! Scaleway implementation of the remote volume API.

mod attachment;
mod error;
mod volume;

use scaleway_rs::ScalewayApi;

use crate::backend::{BackendFuture, VolumeBackend, VolumeHandle};
use crate::config::ScalewayConfig;
use crate::device::DeviceSlot;
use crate::identity::InstanceIdentity;

pub use error::ScalewayBackendError;

/// Backend that attaches block volumes through the Scaleway Instances API.
#[derive(Clone)]
pub struct ScalewayBackend {
    api: ScalewayApi,
    secret_key: String,
}

impl ScalewayBackend {
    /// Constructs a new backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::Config`] when no secret key is
    /// configured.
    pub fn new(config: &ScalewayConfig) -> Result<Self, ScalewayBackendError> {
        let secret_key = config.require_secret_key()?.to_owned();
        Ok(Self {
            api: ScalewayApi::new(&secret_key),
            secret_key,
        })
    }
}

impl VolumeBackend for ScalewayBackend {
    type Error = ScalewayBackendError;

    fn attach<'a>(
        &'a self,
        volume: &'a VolumeHandle,
        identity: &'a InstanceIdentity,
        slot: &'a DeviceSlot,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.attach_volume(volume, identity, slot).await })
    }

    fn detach<'a>(
        &'a self,
        volume: &'a VolumeHandle,
        identity: &'a InstanceIdentity,
        _slot: Option<&'a DeviceSlot>,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move { self.detach_volume(volume, identity).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DEFAULT_METADATA_URL;

    fn config(secret_key: Option<&str>) -> ScalewayConfig {
        ScalewayConfig {
            secret_key: secret_key.map(str::to_owned),
            metadata_url: String::from(DEFAULT_METADATA_URL),
            instance_id: None,
            default_zone: None,
        }
    }

    #[test]
    fn backend_requires_secret_key() {
        let err = ScalewayBackend::new(&config(None))
            .err()
            .expect("secret key required");

        assert!(
            matches!(err, ScalewayBackendError::Config(ref message) if message.contains("SCW_SECRET_KEY")),
            "got {err:?}"
        );
    }

    #[test]
    fn backend_trims_secret_key() {
        let backend = ScalewayBackend::new(&config(Some(" SCWSECRET "))).expect("backend");

        assert_eq!(backend.secret_key, "SCWSECRET");
    }
}

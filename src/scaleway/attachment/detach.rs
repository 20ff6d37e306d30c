//! Block volume detachment for the Scaleway backend.

use crate::backend::VolumeHandle;
use crate::identity::InstanceIdentity;

use super::super::volume::without_volume;
use super::super::{ScalewayBackend, ScalewayBackendError};
use super::VolumePatchContext;

impl ScalewayBackend {
    /// Detaches `volume` while preserving every other volume on the server.
    ///
    /// A volume that is not in the map is already detached; no request is
    /// sent.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::VolumeDetachFailed`] when the API
    /// rejects the request.
    pub(in crate::scaleway) async fn detach_volume(
        &self,
        volume: &VolumeHandle,
        identity: &InstanceIdentity,
    ) -> Result<(), ScalewayBackendError> {
        let context = VolumePatchContext::detach(volume.id());
        let current = self.current_volumes(identity, context).await?;
        let Some(request) = without_volume(&current, volume.id()) else {
            tracing::debug!(volume = volume.id(), "volume not attached; nothing to detach");
            return Ok(());
        };
        self.patch_instance_volumes(identity, &request, context)
            .await
    }
}

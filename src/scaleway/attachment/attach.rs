//! Block volume attachment for the Scaleway backend.

use crate::backend::VolumeHandle;
use crate::device::DeviceSlot;
use crate::identity::InstanceIdentity;

use super::super::volume::{AttachPlan, with_volume};
use super::super::{ScalewayBackend, ScalewayBackendError};
use super::VolumePatchContext;

impl ScalewayBackend {
    /// Attaches `volume` at the slot's index in the server's volume map.
    ///
    /// The attachment uses a direct HTTP PATCH call since the `scaleway-rs`
    /// crate does not expose volume management. Existing entries are sent
    /// back unchanged so nothing else is detached by the replacement.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayBackendError::SlotOccupied`] when another volume
    /// holds the index and [`ScalewayBackendError::VolumeAttachmentFailed`]
    /// when the API rejects the request.
    pub(in crate::scaleway) async fn attach_volume(
        &self,
        volume: &VolumeHandle,
        identity: &InstanceIdentity,
        slot: &DeviceSlot,
    ) -> Result<(), ScalewayBackendError> {
        let context = VolumePatchContext::attach(volume.id());
        let current = self.current_volumes(identity, context).await?;
        match with_volume(&current, volume.id(), slot.index) {
            AttachPlan::Patch(request) => {
                tracing::debug!(
                    volume = volume.id(),
                    index = slot.index,
                    device = %slot.platform_name,
                    "patching server volume map"
                );
                self.patch_instance_volumes(identity, &request, context)
                    .await
            }
            AttachPlan::Occupied { occupant } => Err(ScalewayBackendError::SlotOccupied {
                slot: slot.index.to_string(),
                instance_id: identity.instance_id().to_owned(),
                occupant,
            }),
        }
    }
}

//! Volume map payloads for the Instances API.
//!
//! The API has no dedicated attach/detach call for block volumes: the
//! server's whole volume map is replaced with a `PATCH`. These helpers
//! derive the new map from the current one.

use std::collections::BTreeMap;

use serde::Serialize;

/// Index of the boot volume in the server's volume map.
const BOOT_INDEX: &str = "0";

/// Volume reference for attachment in the Scaleway API.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct VolumeAttachment {
    /// Volume identifier (UUID).
    pub id: String,
    /// Whether this volume should be used for booting.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub boot: bool,
}

/// Request body for `PATCH /servers/{id}` replacing the volume map.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct UpdateInstanceVolumesRequest {
    /// Volume map keyed by index ("0" for root, "1" for first additional, etc.).
    pub volumes: BTreeMap<String, VolumeAttachment>,
}

/// Outcome of adding a volume to the current map.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum AttachPlan {
    /// Send this request.
    Patch(UpdateInstanceVolumesRequest),
    /// Another volume already sits at the requested index.
    Occupied {
        /// Volume currently at the index.
        occupant: String,
    },
}

fn rebuild<'a>(
    current: impl Iterator<Item = (&'a String, &'a String)>,
) -> BTreeMap<String, VolumeAttachment> {
    current
        .map(|(index, id)| {
            (
                index.clone(),
                VolumeAttachment {
                    id: id.clone(),
                    boot: index == BOOT_INDEX,
                },
            )
        })
        .collect()
}

/// Adds `volume_id` at `index` to `current` (index to volume ID).
pub(crate) fn with_volume(
    current: &BTreeMap<String, String>,
    volume_id: &str,
    index: usize,
) -> AttachPlan {
    let key = index.to_string();
    if let Some(occupant) = current.get(&key).filter(|id| id.as_str() != volume_id) {
        return AttachPlan::Occupied {
            occupant: occupant.clone(),
        };
    }
    let mut volumes = rebuild(current.iter());
    volumes.insert(
        key,
        VolumeAttachment {
            id: volume_id.to_owned(),
            boot: false,
        },
    );
    AttachPlan::Patch(UpdateInstanceVolumesRequest { volumes })
}

/// Removes every entry for `volume_id` from `current`; `None` when the
/// volume is not attached.
pub(crate) fn without_volume(
    current: &BTreeMap<String, String>,
    volume_id: &str,
) -> Option<UpdateInstanceVolumesRequest> {
    if !current.values().any(|id| id == volume_id) {
        return None;
    }
    let volumes = rebuild(current.iter().filter(|(_, id)| id.as_str() != volume_id));
    Some(UpdateInstanceVolumesRequest { volumes })
}

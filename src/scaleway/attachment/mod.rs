//! Volume map reads and writes against the Instances API.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use crate::identity::InstanceIdentity;

use super::volume::UpdateInstanceVolumesRequest;
use super::{ScalewayBackend, ScalewayBackendError};

mod attach;
mod detach;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

#[derive(Copy, Clone, Debug)]
enum VolumePatchAction {
    Attach,
    Detach,
}

impl VolumePatchAction {
    const fn into_error(
        self,
        volume_id: String,
        instance_id: String,
        message: String,
    ) -> ScalewayBackendError {
        match self {
            Self::Attach => ScalewayBackendError::VolumeAttachmentFailed {
                volume_id,
                instance_id,
                message,
            },
            Self::Detach => ScalewayBackendError::VolumeDetachFailed {
                volume_id,
                instance_id,
                message,
            },
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct VolumePatchContext<'a> {
    volume_id: &'a str,
    action: VolumePatchAction,
}

impl<'a> VolumePatchContext<'a> {
    const fn attach(volume_id: &'a str) -> Self {
        Self {
            volume_id,
            action: VolumePatchAction::Attach,
        }
    }

    const fn detach(volume_id: &'a str) -> Self {
        Self {
            volume_id,
            action: VolumePatchAction::Detach,
        }
    }

    fn failure(self, identity: &InstanceIdentity, message: String) -> ScalewayBackendError {
        self.action.into_error(
            self.volume_id.to_owned(),
            identity.instance_id().to_owned(),
            message,
        )
    }
}

impl ScalewayBackend {
    /// Reads the server's volume map as index to volume ID.
    async fn current_volumes(
        &self,
        identity: &InstanceIdentity,
        context: VolumePatchContext<'_>,
    ) -> Result<BTreeMap<String, String>, ScalewayBackendError> {
        let instance = self
            .api
            .get_instance_async(identity.zone(), identity.instance_id())
            .await
            .map_err(|err| context.failure(identity, err.to_string()))?;

        Ok(instance
            .volumes
            .volumes
            .iter()
            .map(|(index, volume)| (index.clone(), volume.id.clone()))
            .collect())
    }

    /// Sends a PATCH request replacing the server's volume map.
    async fn patch_instance_volumes(
        &self,
        identity: &InstanceIdentity,
        request: &UpdateInstanceVolumesRequest,
        context: VolumePatchContext<'_>,
    ) -> Result<(), ScalewayBackendError> {
        let url = format!(
            "{SCALEWAY_INSTANCE_API_BASE}/zones/{}/servers/{}",
            identity.zone(),
            identity.instance_id()
        );

        let response = HTTP_CLIENT
            .patch(&url)
            .header("X-Auth-Token", &self.secret_key)
            .json(request)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .map_err(|err| ScalewayBackendError::Provider {
                message: err.to_string(),
            })?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        Err(context.failure(identity, format!("status {status}: {error_text}")))
    }
}

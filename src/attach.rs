//! Remote attach/detach plus the bounded wait for the guest device.

use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::time::{Instant, sleep};

use crate::backend::{VolumeBackend, VolumeHandle};
use crate::device::{DeviceProbe, DeviceSlot};
use crate::identity::InstanceIdentity;

/// Default time allowed for the device to appear after the API accepts the
/// attach request.
pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(90);

/// Default interval between device existence checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of the volume attachment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttachmentState {
    /// No attach request issued.
    Unattached,
    /// The API accepted the request; waiting for the guest device.
    Attaching,
    /// The guest device is present.
    Attached,
    /// Detach requested.
    Detaching,
    /// Detach call returned, successfully or not.
    Detached,
}

/// One volume bound (or being bound) to this instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attachment {
    volume: VolumeHandle,
    identity: InstanceIdentity,
    slot: Option<DeviceSlot>,
    state: AttachmentState,
}

impl Attachment {
    /// Starts tracking an attachment of `volume` at `slot`.
    #[must_use]
    pub const fn new(volume: VolumeHandle, identity: InstanceIdentity, slot: DeviceSlot) -> Self {
        Self {
            volume,
            identity,
            slot: Some(slot),
            state: AttachmentState::Unattached,
        }
    }

    /// Tracks a volume attached by an earlier invocation, whose slot is not
    /// known. Only detach makes sense on such an attachment.
    #[must_use]
    pub const fn existing(volume: VolumeHandle, identity: InstanceIdentity) -> Self {
        Self {
            volume,
            identity,
            slot: None,
            state: AttachmentState::Attached,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> AttachmentState {
        self.state
    }

    /// Slot used for the attachment, when allocated by this run.
    #[must_use]
    pub const fn slot(&self) -> Option<&DeviceSlot> {
        self.slot.as_ref()
    }

    fn transition(&mut self, next: AttachmentState) {
        tracing::debug!(
            volume = self.volume.id(),
            from = ?self.state,
            to = ?next,
            "attachment state change"
        );
        self.state = next;
    }
}

/// Errors raised while attaching.
#[derive(Debug, Error)]
pub enum AttachError<BackendError>
where
    BackendError: std::error::Error + 'static,
{
    /// The control plane rejected the attach request.
    #[error("failed to attach {volume_id} at {platform_name}: {source}")]
    Failed {
        /// Volume that was requested.
        volume_id: String,
        /// Platform-facing device name requested.
        platform_name: String,
        /// Provider error.
        #[source]
        source: BackendError,
    },
    /// The guest device never appeared.
    #[error("device {device} did not appear within {waited_secs} seconds")]
    Timeout {
        /// Device path being polled.
        device: Utf8PathBuf,
        /// Configured timeout in seconds.
        waited_secs: u64,
    },
    /// Checking for the device failed with an OS error other than absence.
    #[error("failed to check device {device}: {message}")]
    DeviceCheckFailed {
        /// Device path being polled.
        device: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// The attachment carries no slot to attach at.
    #[error("no device slot allocated for {volume_id}")]
    MissingSlot {
        /// Volume that was requested.
        volume_id: String,
    },
}

/// Drives the remote attach/detach calls and the device wait loop.
#[derive(Clone, Debug)]
pub struct VolumeAttacher<B, P> {
    backend: B,
    probe: P,
    timeout: Duration,
    poll_interval: Duration,
}

impl<B, P> VolumeAttacher<B, P>
where
    B: VolumeBackend,
    P: DeviceProbe,
{
    /// Creates an attacher with the default timeout and poll interval.
    #[must_use]
    pub const fn new(backend: B, probe: P) -> Self {
        Self {
            backend,
            probe,
            timeout: DEFAULT_ATTACH_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the device wait timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the device poll interval.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Issues the single remote attach request.
    ///
    /// On failure the attachment returns to `Unattached`: nothing was
    /// claimed remotely, so there is nothing to detach.
    ///
    /// # Errors
    ///
    /// Returns [`AttachError::Failed`] when the API rejects the request.
    pub async fn request_attach(
        &self,
        attachment: &mut Attachment,
    ) -> Result<(), AttachError<B::Error>> {
        let Some(slot) = attachment.slot.clone() else {
            return Err(AttachError::MissingSlot {
                volume_id: attachment.volume.id().to_owned(),
            });
        };
        tracing::info!(
            volume = attachment.volume.id(),
            device = %slot.platform_name,
            "attaching volume"
        );
        attachment.transition(AttachmentState::Attaching);
        if let Err(source) = self
            .backend
            .attach(&attachment.volume, &attachment.identity, &slot)
            .await
        {
            attachment.transition(AttachmentState::Unattached);
            return Err(AttachError::Failed {
                volume_id: attachment.volume.id().to_owned(),
                platform_name: slot.platform_name,
                source,
            });
        }
        Ok(())
    }

    /// Polls for the OS-visible device until it appears or the timeout
    /// elapses.
    ///
    /// # Errors
    ///
    /// Returns [`AttachError::Timeout`] when the device never appears and
    /// [`AttachError::DeviceCheckFailed`] on any OS error other than absence.
    pub async fn wait_for_device(
        &self,
        attachment: &mut Attachment,
    ) -> Result<(), AttachError<B::Error>> {
        let Some(device) = attachment.slot.as_ref().map(|slot| slot.os_path.clone()) else {
            return Err(AttachError::MissingSlot {
                volume_id: attachment.volume.id().to_owned(),
            });
        };
        let deadline = Instant::now() + self.timeout;

        loop {
            match self.probe.exists(&device) {
                Ok(true) => {
                    attachment.transition(AttachmentState::Attached);
                    return Ok(());
                }
                Ok(false) => {}
                Err(err) => {
                    return Err(AttachError::DeviceCheckFailed {
                        device,
                        message: err.to_string(),
                    });
                }
            }
            if Instant::now() >= deadline {
                return Err(AttachError::Timeout {
                    device,
                    waited_secs: self.timeout.as_secs(),
                });
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Issues the single remote detach request.
    ///
    /// The attachment always ends `Detached`, even when the call fails, so
    /// cleanup stays terminal.
    ///
    /// # Errors
    ///
    /// Returns the provider error; callers running cleanup log it.
    pub async fn detach(&self, attachment: &mut Attachment) -> Result<(), B::Error> {
        tracing::info!(volume = attachment.volume.id(), "detaching volume");
        attachment.transition(AttachmentState::Detaching);
        let result = self
            .backend
            .detach(
                &attachment.volume,
                &attachment.identity,
                attachment.slot.as_ref(),
            )
            .await;
        attachment.transition(AttachmentState::Detached);
        result
    }
}

//! Resolution of the current instance's identity.
//!
//! The identity is resolved once at startup. A run never touches a remote
//! resource without one, so an unresolvable identity aborts before the
//! device allocator even looks at the device namespace.

use std::sync::LazyLock;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::backend::BackendFuture;

/// Default Scaleway instance metadata endpoint.
pub const DEFAULT_METADATA_URL: &str = "http://169.254.42.42/conf?format=json";

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Placeholder some metadata services return outside a cloud instance.
const UNKNOWN_INSTANCE: &str = "unknown";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(METADATA_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// The instance this process runs on, plus the zone it lives in.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceIdentity {
    instance_id: String,
    zone: String,
}

impl InstanceIdentity {
    /// Builds an identity, rejecting blank values and the `unknown`
    /// placeholder.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Unresolved`] when either value is unusable.
    pub fn new(
        instance_id: impl Into<String>,
        zone: impl Into<String>,
    ) -> Result<Self, IdentityError> {
        let trimmed_id = instance_id.into().trim().to_owned();
        let trimmed_zone = zone.into().trim().to_owned();
        if trimmed_id.is_empty() || trimmed_id.eq_ignore_ascii_case(UNKNOWN_INSTANCE) {
            return Err(IdentityError::Unresolved {
                message: String::from("instance id is unknown; not running on a cloud instance?"),
            });
        }
        if trimmed_zone.is_empty() {
            return Err(IdentityError::Unresolved {
                message: format!("instance {trimmed_id} reported no zone"),
            });
        }
        Ok(Self {
            instance_id: trimmed_id,
            zone: trimmed_zone,
        })
    }

    /// Provider instance identifier.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Availability zone (region) the instance runs in.
    #[must_use]
    pub fn zone(&self) -> &str {
        &self.zone
    }
}

/// Errors raised while resolving the instance identity.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum IdentityError {
    /// The environment does not describe a usable instance.
    #[error("cannot determine instance identity: {message}")]
    Unresolved {
        /// Human-readable reason.
        message: String,
    },
    /// The metadata endpoint could not be queried.
    #[error("metadata request to {url} failed: {message}")]
    Metadata {
        /// Endpoint that was queried.
        url: String,
        /// Transport or decoding error.
        message: String,
    },
}

/// Source of the local instance identity.
pub trait IdentitySource {
    /// Resolves the identity of the instance running this process.
    fn resolve(&self) -> BackendFuture<'_, InstanceIdentity, IdentityError>;
}

/// Identity supplied directly through configuration.
#[derive(Clone, Debug)]
pub struct StaticIdentitySource {
    instance_id: String,
    zone: String,
}

impl StaticIdentitySource {
    /// Creates a source that always reports the given values.
    #[must_use]
    pub fn new(instance_id: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            zone: zone.into(),
        }
    }
}

impl IdentitySource for StaticIdentitySource {
    fn resolve(&self) -> BackendFuture<'_, InstanceIdentity, IdentityError> {
        Box::pin(async move { InstanceIdentity::new(&self.instance_id, &self.zone) })
    }
}

/// Queries the instance metadata service over HTTP.
#[derive(Clone, Debug)]
pub struct MetadataIdentitySource {
    url: String,
}

#[derive(Debug, Deserialize)]
struct MetadataDocument {
    #[serde(default)]
    id: String,
    #[serde(default)]
    zone: Option<String>,
    #[serde(default)]
    location: Option<MetadataLocation>,
}

#[derive(Debug, Deserialize)]
struct MetadataLocation {
    #[serde(default)]
    zone_id: Option<String>,
}

impl MetadataDocument {
    fn into_identity(self) -> Result<InstanceIdentity, IdentityError> {
        let zone = self
            .zone
            .or_else(|| self.location.and_then(|location| location.zone_id))
            .unwrap_or_default();
        InstanceIdentity::new(self.id, zone)
    }
}

impl MetadataIdentitySource {
    /// Creates a source querying `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn metadata_error(&self, err: impl std::fmt::Display) -> IdentityError {
        IdentityError::Metadata {
            url: self.url.clone(),
            message: err.to_string(),
        }
    }
}

impl Default for MetadataIdentitySource {
    fn default() -> Self {
        Self::new(DEFAULT_METADATA_URL)
    }
}

impl IdentitySource for MetadataIdentitySource {
    fn resolve(&self) -> BackendFuture<'_, InstanceIdentity, IdentityError> {
        Box::pin(async move {
            let response = HTTP_CLIENT
                .get(&self.url)
                .send()
                .await
                .map_err(|err| self.metadata_error(err))?;
            if !response.status().is_success() {
                return Err(self.metadata_error(format!("status {}", response.status())));
            }
            let document: MetadataDocument = response
                .json()
                .await
                .map_err(|err| self.metadata_error(err))?;
            let identity = document.into_identity()?;
            tracing::debug!(
                instance_id = identity.instance_id(),
                zone = identity.zone(),
                "resolved instance identity"
            );
            Ok(identity)
        })
    }
}

//! Upload gating by network origin and shared secret.

use crate::services::network::NetworkClassifier;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Why an upload was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    UploadToken,
    InternalNetwork,
    ExternalUploadsEnabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadDecision {
    Allow(AllowReason),
    Deny(String),
}

impl UploadDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, UploadDecision::Allow(_))
    }
}

/// What a caller may do, as reported by the access-info endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessInfo {
    pub client_ip: String,
    pub is_internal: bool,
    pub can_upload: bool,
    pub can_download: bool,
}

/// Immutable; lives inside a configuration snapshot.
#[derive(Clone)]
pub struct AccessPolicy {
    classifier: NetworkClassifier,
    allow_external_upload: bool,
    upload_secret: Option<String>,
}

impl AccessPolicy {
    pub fn new(
        classifier: NetworkClassifier,
        allow_external_upload: bool,
        upload_secret: Option<String>,
    ) -> Self {
        Self {
            classifier,
            allow_external_upload,
            upload_secret: upload_secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn classifier(&self) -> &NetworkClassifier {
        &self.classifier
    }

    pub fn allow_external_upload(&self) -> bool {
        self.allow_external_upload
    }

    pub fn has_upload_secret(&self) -> bool {
        self.upload_secret.is_some()
    }

    pub fn upload_secret(&self) -> Option<&str> {
        self.upload_secret.as_deref()
    }

    pub fn is_internal(&self, address: &str) -> bool {
        self.classifier.is_internal(address)
    }

    /// Decision order: matching secret, internal origin, global external
    /// flag, deny.
    pub fn check_upload(&self, address: &str, supplied_token: Option<&str>) -> UploadDecision {
        if let (Some(secret), Some(supplied)) = (self.upload_secret.as_deref(), supplied_token) {
            if bool::from(secret.as_bytes().ct_eq(supplied.trim().as_bytes())) {
                debug!(address, "upload allowed by token");
                return UploadDecision::Allow(AllowReason::UploadToken);
            }
            warn!(address, "upload token supplied but did not match");
        }

        if self.classifier.is_internal(address) {
            return UploadDecision::Allow(AllowReason::InternalNetwork);
        }

        if self.allow_external_upload {
            return UploadDecision::Allow(AllowReason::ExternalUploadsEnabled);
        }

        UploadDecision::Deny("external uploads disabled".into())
    }

    /// Download is never gated by origin: holding the token is enough.
    pub fn access_info(&self, address: &str) -> AccessInfo {
        let is_internal = self.classifier.is_internal(address);
        AccessInfo {
            client_ip: address.to_string(),
            is_internal,
            can_upload: is_internal || self.allow_external_upload,
            can_download: true,
        }
    }
}

impl std::fmt::Debug for AccessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessPolicy")
            .field("internal_networks", &self.classifier)
            .field("allow_external_upload", &self.allow_external_upload)
            .field("upload_secret", &self.upload_secret.as_ref().map(|_| "***"))
            .finish()
    }
}

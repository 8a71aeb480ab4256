//! Audit logging for certificate lifecycle events.
//!
//! Every event is emitted via `tracing` with structured fields, making the
//! audit trail queryable by any log aggregator. Events never carry key
//! material: certificates are referenced by serial and SHA-256 fingerprint.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `ca.created` | A new root was generated and persisted |
//! | `ca.loaded` | An existing root was loaded from storage |
//! | `cert.issued` | A new agent certificate was signed and stored |
//! | `cert.reused` | `issue` returned an existing unexpired certificate |
//! | `cert.revoked` | An agent certificate was revoked |
//! | `cert.rejected` | Validation failed; `reason` holds the reason code |
//! | `cert.issue_failed` | Issuance failed; `reason` holds the error |

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mtls::codec::CertificateInfo;
use crate::mtls::record::AgentCertificate;

/// Structured audit event emitted for every certificate lifecycle transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"cert.issued"`).
    pub event: &'static str,
    /// Agent the event concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Certificate serial number.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<u64>,
    /// SHA-256 fingerprint of the certificate DER.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Expiry of the certificate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Reason code for rejections and failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            agent_id: None,
            serial_number: None,
            fingerprint: None,
            expires_at: None,
            reason: None,
        }
    }

    /// Construct a `ca.created` event.
    #[must_use]
    pub fn ca_created(root: &CertificateInfo) -> Self {
        Self {
            fingerprint: Some(root.fingerprint()),
            expires_at: Some(root.not_after),
            ..Self::new("ca.created")
        }
    }

    /// Construct a `ca.loaded` event.
    #[must_use]
    pub fn ca_loaded(root: &CertificateInfo, next_serial: u64) -> Self {
        Self {
            serial_number: Some(next_serial),
            fingerprint: Some(root.fingerprint()),
            expires_at: Some(root.not_after),
            ..Self::new("ca.loaded")
        }
    }

    /// Construct a `cert.issued` event.
    #[must_use]
    pub fn issued(cert: &AgentCertificate, fingerprint: String) -> Self {
        Self {
            agent_id: Some(cert.agent_id.clone()),
            serial_number: Some(cert.serial_number),
            fingerprint: Some(fingerprint),
            expires_at: Some(cert.expires_at),
            ..Self::new("cert.issued")
        }
    }

    /// Construct a `cert.reused` event.
    #[must_use]
    pub fn reused(cert: &AgentCertificate) -> Self {
        Self {
            agent_id: Some(cert.agent_id.clone()),
            serial_number: Some(cert.serial_number),
            expires_at: Some(cert.expires_at),
            ..Self::new("cert.reused")
        }
    }

    /// Construct a `cert.revoked` event.
    #[must_use]
    pub fn revoked(agent_id: &str, serial_number: Option<u64>) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            serial_number,
            ..Self::new("cert.revoked")
        }
    }

    /// Construct a `cert.rejected` event.
    #[must_use]
    pub fn rejected(agent_id: &str, serial_number: Option<u64>, reason: &str) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            serial_number,
            reason: Some(reason.to_string()),
            ..Self::new("cert.rejected")
        }
    }

    /// Construct a `cert.issue_failed` event.
    #[must_use]
    pub fn issue_failed(agent_id: &str, reason: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.to_string()),
            reason: Some(reason.into()),
            ..Self::new("cert.issue_failed")
        }
    }

    fn is_failure(&self) -> bool {
        self.reason.is_some()
    }
}

/// Emit an audit event via `tracing` with the JSON blob in the `audit` field.
///
/// ```text
/// INFO mtls::audit audit={"event":"cert.issued","agent_id":"agent-1",...}
/// ```
///
/// Rejections and failures are emitted at `warn`.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) if event.is_failure() => tracing::warn!(audit = %json, "mtls audit"),
        Ok(ref json) => tracing::info!(audit = %json, "mtls audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

//! Issued agent certificate records and their derived status.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::mtls::codec::SubjectInfo;

/// Window before expiry in which a certificate reports `expiring_soon`.
pub const EXPIRING_SOON_WINDOW_DAYS: i64 = 7;

/// Optional subject attributes supplied by the caller at issuance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentInfo {
    /// Organisation (O).
    pub organization: Option<String>,
    /// Organisational Unit (OU).
    pub organizational_unit: Option<String>,
    /// Contact email, written as PKCS #9 emailAddress and an RFC 822 SAN.
    pub email: Option<String>,
}

impl AgentInfo {
    /// Certificate subject for `agent_id` with these attributes.
    #[must_use]
    pub fn subject_for(&self, agent_id: &str) -> SubjectInfo {
        SubjectInfo {
            common_name: agent_id.to_string(),
            organization: self.organization.clone(),
            organizational_unit: self.organizational_unit.clone(),
            email: self.email.clone(),
        }
    }
}

/// PEM-encoded private key. Never printed and never serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKeyPem(String);

impl PrivateKeyPem {
    /// Wrap a PEM string.
    #[must_use]
    pub fn new(pem: String) -> Self {
        Self(pem)
    }

    /// The PEM text, for persistence and TLS context construction only.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateKeyPem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKeyPem([REDACTED])")
    }
}

/// A certificate issued to one agent. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentCertificate {
    /// Agent identifier; store key and subject Common Name.
    pub agent_id: String,
    /// Agent private key (exclusive to the agent).
    #[serde(skip)]
    pub private_key: PrivateKeyPem,
    /// PEM certificate signed by the authority.
    pub certificate_pem: String,
    /// PEM copy of the authority certificate, for chain validation.
    pub ca_certificate_pem: String,
    /// Start of validity.
    pub issued_at: DateTime<Utc>,
    /// End of validity (`issued_at` + configured validity period).
    pub expires_at: DateTime<Utc>,
    /// Serial number allocated by the authority.
    pub serial_number: u64,
}

impl AgentCertificate {
    /// `true` once `now` has reached `expires_at`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Derived status at `now`.
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> CertificateStatus {
        let expires_in = (self.expires_at - now).max(Duration::zero());
        let status = if expires_in <= Duration::zero() {
            StatusKind::Expired
        } else if expires_in < Duration::days(EXPIRING_SOON_WINDOW_DAYS) {
            StatusKind::ExpiringSoon
        } else {
            StatusKind::Valid
        };

        CertificateStatus {
            agent_id: self.agent_id.clone(),
            serial_number: self.serial_number,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            is_expired: status == StatusKind::Expired,
            expires_in_secs: expires_in.num_seconds().unsigned_abs(),
            status,
        }
    }
}

/// Lifecycle bucket of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// More than seven days left.
    Valid,
    /// Less than seven days left.
    ExpiringSoon,
    /// Past `expires_at`.
    Expired,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Valid => "valid",
            Self::ExpiringSoon => "expiring_soon",
            Self::Expired => "expired",
        })
    }
}

/// Status report derived from a record and the current time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateStatus {
    /// Agent identifier.
    pub agent_id: String,
    /// Serial number.
    pub serial_number: u64,
    /// Start of validity.
    pub issued_at: DateTime<Utc>,
    /// End of validity.
    pub expires_at: DateTime<Utc>,
    /// `status == expired`.
    pub is_expired: bool,
    /// Seconds until expiry; zero once expired.
    pub expires_in_secs: u64,
    /// Lifecycle bucket.
    pub status: StatusKind,
}

impl CertificateStatus {
    /// Remaining lifetime as a non-negative duration.
    #[must_use]
    pub fn expires_in(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.expires_in_secs)
    }
}

//! Validation of certificates presented by agents.
//!
//! A presented certificate is accepted only if it decodes, was issued and
//! signed by this authority, is inside its validity window, names the
//! claimed agent, has not been revoked and matches what the store holds for
//! that agent. Checks run in that order and stop at the first failure.

use std::fmt;
use std::sync::Arc;

use subtle::ConstantTimeEq;
use tracing::debug;

use crate::mtls::audit::{self, AuditEvent};
use crate::mtls::authority::CertificateAuthority;
use crate::mtls::clock::Clock;
use crate::mtls::codec::{CertificateCodec, CertificateInfo};
use crate::mtls::store::CertificateStore;

/// Why a presented certificate was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailure {
    /// Not a decodable X.509 certificate.
    Malformed,
    /// Issuer is not this authority.
    UntrustedIssuer,
    /// Signature does not verify with the authority key.
    BadSignature,
    /// `now` is before `not_before`.
    NotYetValid,
    /// `now` is after `not_after` (a certificate is still valid at exactly
    /// `not_after`).
    Expired,
    /// Subject CN differs from the claimed agent id.
    SubjectMismatch,
    /// The store holds a different certificate for the agent.
    StoreMismatch,
    /// The serial was revoked.
    Revoked,
}

impl ValidationFailure {
    /// Reason code used in logs and audit events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::UntrustedIssuer => "untrusted-issuer",
            Self::BadSignature => "bad-signature",
            Self::NotYetValid => "not-yet-valid",
            Self::Expired => "expired",
            Self::SubjectMismatch => "subject-mismatch",
            Self::StoreMismatch => "store-mismatch",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks presented certificates against the authority and the store.
pub struct ValidationService {
    authority: Arc<CertificateAuthority>,
    store: Arc<CertificateStore>,
    clock: Arc<dyn Clock>,
}

impl ValidationService {
    /// Create the service.
    #[must_use]
    pub fn new(
        authority: Arc<CertificateAuthority>,
        store: Arc<CertificateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            authority,
            store,
            clock,
        }
    }

    /// `true` if `certificate_pem` is currently valid for `agent_id`.
    ///
    /// The validity window is inclusive at both ends: the certificate is
    /// accepted while `not_before <= now <= not_after`. At exactly
    /// `expires_at` this returns `true` even though
    /// [`CertificateStatus`](crate::mtls::CertificateStatus) already reports
    /// the certificate as expired.
    ///
    /// Never fails; every rejection is logged with its reason code.
    #[must_use]
    pub fn validate(&self, certificate_pem: impl AsRef<[u8]>, agent_id: &str) -> bool {
        self.check(certificate_pem, agent_id).is_ok()
    }

    /// Like [`validate`](Self::validate) but returns the decoded certificate
    /// or the reason it was rejected.
    pub fn check(
        &self,
        certificate_pem: impl AsRef<[u8]>,
        agent_id: &str,
    ) -> std::result::Result<CertificateInfo, ValidationFailure> {
        let presented = certificate_pem.as_ref();
        let mut serial = None;
        let outcome = CertificateCodec::decode(presented)
            .map_err(|e| {
                debug!(agent_id, error = %e, "Presented certificate did not decode");
                ValidationFailure::Malformed
            })
            .and_then(|info| {
                serial = Some(info.serial_number);
                self.check_decoded(presented, info, agent_id)
            });

        if let Err(failure) = outcome {
            audit::emit(&AuditEvent::rejected(agent_id, serial, failure.as_str()));
        }
        outcome
    }

    fn check_decoded(
        &self,
        presented: &[u8],
        info: CertificateInfo,
        agent_id: &str,
    ) -> std::result::Result<CertificateInfo, ValidationFailure> {
        if info.issuer_common_name != self.authority.common_name() {
            return Err(ValidationFailure::UntrustedIssuer);
        }
        if self.authority.verify_issued(&info).is_err() {
            return Err(ValidationFailure::BadSignature);
        }

        let now = self.clock.now();
        if now < info.not_before {
            return Err(ValidationFailure::NotYetValid);
        }
        if now > info.not_after {
            return Err(ValidationFailure::Expired);
        }

        if info.subject.common_name != agent_id {
            return Err(ValidationFailure::SubjectMismatch);
        }

        if self.store.is_revoked(info.serial_number) {
            return Err(ValidationFailure::Revoked);
        }
        if let Some(stored) = self.store.get(agent_id)
            && !bool::from(stored.certificate_pem.as_bytes().ct_eq(presented))
        {
            return Err(ValidationFailure::StoreMismatch);
        }

        Ok(info)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

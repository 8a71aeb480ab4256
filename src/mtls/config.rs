//! mTLS certificate authority configuration types.
//!
//! Defines the YAML-deserialisable `mtls` block: where the authority and
//! per-agent certificates live, how long agent certificates are valid, and
//! how much blocking crypto work may run at once.
//!
//! # Example YAML
//!
//! ```yaml
//! mtls:
//!   cert_path: "~/.payments-gateway/certs"
//!   certificate_validity_days: 30
//!   ca_common_name: "Payments Gateway Agent CA"
//!   san_domain: "agents.local"
//!   max_concurrent_issuance: 4
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::mtls::keys::KeyAlgorithm;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level mTLS config
// ─────────────────────────────────────────────────────────────────────────────

/// Certificate authority configuration block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MtlsConfig {
    /// Root directory for `ca-key.pem`, `ca-cert.pem` and one sub-directory per agent.
    ///
    /// A leading `~` is expanded to the home directory.
    pub cert_path: String,

    /// Validity period of issued agent certificates, in days. Must be positive.
    pub certificate_validity_days: u32,

    /// Common Name of the self-signed root certificate.
    pub ca_common_name: String,

    /// Validity period of the root certificate, in days.
    pub ca_validity_days: u32,

    /// DNS suffix for the second SAN entry (`<agent_id>.<san_domain>`).
    pub san_domain: String,

    /// Upper bound on concurrent key generation / signing jobs.
    pub max_concurrent_issuance: usize,

    /// Key algorithm for the authority.
    pub ca_key_algorithm: KeyAlgorithm,

    /// Key algorithm for agent certificates.
    pub agent_key_algorithm: KeyAlgorithm,
}

impl Default for MtlsConfig {
    fn default() -> Self {
        Self {
            cert_path: "~/.payments-gateway/certs".to_string(),
            certificate_validity_days: 365,
            ca_common_name: "Payments Gateway Agent CA".to_string(),
            ca_validity_days: 3650,
            san_domain: "agents.local".to_string(),
            max_concurrent_issuance: 4,
            ca_key_algorithm: KeyAlgorithm::EcdsaP384,
            agent_key_algorithm: KeyAlgorithm::EcdsaP256,
        }
    }
}

impl MtlsConfig {
    /// Config rooted at `dir` with every other field at its default.
    #[must_use]
    pub fn with_cert_path(dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_path: dir.into().display().to_string(),
            ..Self::default()
        }
    }

    /// Check field ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an empty path or CA name, a zero
    /// validity period or concurrency bound, or agent certificates that
    /// would be valid for longer than the root.
    pub fn validate(&self) -> Result<()> {
        if self.cert_path.trim().is_empty() {
            return Err(Error::Config("mtls.cert_path must not be empty".to_string()));
        }
        if self.certificate_validity_days == 0 {
            return Err(Error::Config(
                "mtls.certificate_validity_days must be a positive integer".to_string(),
            ));
        }
        if self.ca_validity_days == 0 {
            return Err(Error::Config(
                "mtls.ca_validity_days must be a positive integer".to_string(),
            ));
        }
        if self.certificate_validity_days > self.ca_validity_days {
            return Err(Error::Config(format!(
                "mtls.certificate_validity_days ({}) must not exceed mtls.ca_validity_days ({})",
                self.certificate_validity_days, self.ca_validity_days
            )));
        }
        if self.ca_common_name.trim().is_empty() {
            return Err(Error::Config("mtls.ca_common_name must not be empty".to_string()));
        }
        if self.max_concurrent_issuance == 0 {
            return Err(Error::Config(
                "mtls.max_concurrent_issuance must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The certificate root with `~` expanded.
    #[must_use]
    pub fn resolved_cert_path(&self) -> PathBuf {
        if let Some(rest) = self.cert_path.strip_prefix('~') {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest.trim_start_matches(['/', '\\']));
            }
        }
        PathBuf::from(&self.cert_path)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

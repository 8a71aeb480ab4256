//! Error types for the payments gateway certificate authority

use std::io;

use thiserror::Error;

/// Result type alias for the payments gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Payments gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing, unreadable or corrupt certificate storage included)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Agent identifier is empty or cannot name a certificate directory
    #[error("Invalid agent id '{0}'")]
    InvalidAgentId(String),

    /// Asymmetric key generation or key parsing failed
    #[error("Key generation error: {0}")]
    KeyGeneration(String),

    /// Certificate could not be encoded or decoded
    #[error("Certificate encoding error: {0}")]
    CertificateEncoding(String),

    /// Signing with the authority key failed
    #[error("Signing error: {0}")]
    Signing(String),

    /// Durable storage read/write failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Issuance for an agent failed; carries the underlying cause
    #[error("Certificate issuance failed for '{agent_id}': {source}")]
    Issuance {
        /// Agent the certificate was requested for
        agent_id: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Transport security context could not be built
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an error as an issuance failure for `agent_id`.
    ///
    /// Already-wrapped issuance errors are returned unchanged.
    pub fn issuance(agent_id: impl Into<String>, source: Self) -> Self {
        match source {
            already @ Self::Issuance { .. } => already,
            other => Self::Issuance {
                agent_id: agent_id.into(),
                source: Box::new(other),
            },
        }
    }

    /// Short machine-readable kind, used in audit events and CLI JSON output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration",
            Self::InvalidAgentId(_) => "invalid_agent_id",
            Self::KeyGeneration(_) => "key_generation",
            Self::CertificateEncoding(_) => "certificate_encoding",
            Self::Signing(_) => "signing",
            Self::Persistence(_) | Self::Io(_) => "persistence",
            Self::Issuance { source, .. } => source.kind(),
            Self::Tls(_) => "tls",
            Self::Json(_) | Self::Internal(_) => "internal",
        }
    }
}

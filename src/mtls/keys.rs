//! Asymmetric key pair generation for the authority and for agents.
//!
//! Thin wrapper over `rcgen::KeyPair` that fixes the algorithm set the
//! gateway accepts and keeps private key material out of `Debug` output.

use std::fmt;

use rcgen::PublicKeyData;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Supported key algorithms.
///
/// ECDSA P-384 is the authority default,
/// ECDSA P-256 the agent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    /// ECDSA over NIST P-256 with SHA-256
    EcdsaP256,
    /// ECDSA over NIST P-384 with SHA-384
    EcdsaP384,
    /// Ed25519
    Ed25519,
}

impl KeyAlgorithm {
    fn signature_algorithm(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::EcdsaP256 => "ecdsa-p256",
            Self::EcdsaP384 => "ecdsa-p384",
            Self::Ed25519 => "ed25519",
        })
    }
}

/// An owned key pair. The private half never leaves this value except as PEM
/// for persistence.
pub struct KeyPair {
    inner: rcgen::KeyPair,
}

impl KeyPair {
    /// Parse a PKCS#8 PEM private key.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyGeneration` if the PEM is not a supported key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let inner = rcgen::KeyPair::from_pem(pem)
            .map_err(|e| Error::KeyGeneration(format!("Failed to parse private key: {e}")))?;
        Ok(Self { inner })
    }

    /// PKCS#8 PEM encoding of the private key.
    #[must_use]
    pub fn private_key_pem(&self) -> String {
        self.inner.serialize_pem()
    }

    /// Raw public key bits, as they appear in a certificate's
    /// `subjectPublicKey` field.
    #[must_use]
    pub fn public_key_raw(&self) -> &[u8] {
        self.inner.der_bytes()
    }

    pub(crate) fn as_rcgen(&self) -> &rcgen::KeyPair {
        &self.inner
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_key_raw()))
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Generates fresh key pairs.
pub struct KeyPairGenerator;

impl KeyPairGenerator {
    /// Generate a key pair for `algorithm`.
    ///
    /// CPU-bound and not cancelable; callers on an async runtime should run
    /// it on a blocking worker.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyGeneration` if the crypto backend fails.
    pub fn generate(algorithm: KeyAlgorithm) -> Result<KeyPair> {
        let inner = rcgen::KeyPair::generate_for(algorithm.signature_algorithm()).map_err(|e| {
            Error::KeyGeneration(format!("Failed to generate {algorithm} key: {e}"))
        })?;
        Ok(KeyPair { inner })
    }
}

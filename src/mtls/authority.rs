//! Certificate authority bootstrap, persistence and signing.
//!
//! The authority is created once per deployment. On startup it is loaded
//! from `<cert_path>` when both `ca-key.pem` and `ca-cert.pem` exist;
//! otherwise a new root is generated and written there. Partial or corrupt
//! authority material is a fatal configuration error: silently minting a new
//! root would orphan every certificate already handed out.

use chrono::Duration;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::mtls::audit::{self, AuditEvent};
use crate::mtls::clock::Clock;
use crate::mtls::codec::{CertificateCodec, CertificateInfo, LeafTemplate, RootTemplate};
use crate::mtls::config::MtlsConfig;
use crate::mtls::keys::{KeyPair, KeyPairGenerator};
use crate::mtls::storage::{self, CertStorage};
use crate::{Error, Result};

/// First serial handed to an agent certificate.
pub const FIRST_SERIAL: u64 = 1;

/// The trust root: key pair, self-signed certificate and serial counter.
#[derive(Debug)]
pub struct CertificateAuthority {
    key: KeyPair,
    certificate_pem: String,
    info: CertificateInfo,
    next_serial: Mutex<u64>,
    storage: CertStorage,
}

impl CertificateAuthority {
    /// Load the authority from `storage`, or create and persist a new one.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if only one of the key/cert files exists, if
    /// either is unreadable or corrupt, or if the key does not belong to the
    /// certificate. Returns `Error::KeyGeneration` / `Error::Signing` /
    /// `Error::Persistence` if creating a new root fails.
    pub fn load_or_create(
        config: &MtlsConfig,
        storage: CertStorage,
        clock: &dyn Clock,
    ) -> Result<Self> {
        let key_path = storage.ca_key_path();
        let cert_path = storage.ca_cert_path();

        match (key_path.exists(), cert_path.exists()) {
            (true, true) => Self::load(storage),
            (false, false) => Self::create(config, storage, clock),
            (key_present, _) => {
                let missing = if key_present { &cert_path } else { &key_path };
                Err(Error::Config(format!(
                    "Incomplete certificate authority in '{}': '{}' is missing; refusing to generate a new root",
                    storage.root().display(),
                    missing.display()
                )))
            }
        }
    }

    fn load(storage: CertStorage) -> Result<Self> {
        let key_pem = storage::read_to_string(&storage.ca_key_path())
            .map_err(|e| Error::Config(format!("Unreadable CA key: {e}")))?;
        let certificate_pem = storage::read_to_string(&storage.ca_cert_path())
            .map_err(|e| Error::Config(format!("Unreadable CA certificate: {e}")))?;

        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| Error::Config(format!("Corrupt CA key: {e}")))?;
        let info = CertificateCodec::decode(&certificate_pem)
            .map_err(|e| Error::Config(format!("Corrupt CA certificate: {e}")))?;

        if !info.is_ca {
            return Err(Error::Config(
                "Stored CA certificate is not a CA certificate".to_string(),
            ));
        }
        if info.public_key != key.public_key_raw() {
            return Err(Error::Config(
                "Stored CA key does not match the stored CA certificate".to_string(),
            ));
        }

        let next_serial = match storage.read_serial()? {
            Some(serial) => serial.max(FIRST_SERIAL),
            None => {
                let recovered = recover_serial(&storage);
                warn!(
                    next_serial = recovered,
                    "CA serial counter missing; continuing after the highest issued serial"
                );
                storage.write_serial(recovered)?;
                recovered
            }
        };

        audit::emit(&AuditEvent::ca_loaded(&info, next_serial));
        Ok(Self {
            key,
            certificate_pem,
            info,
            next_serial: Mutex::new(next_serial),
            storage,
        })
    }

    fn create(config: &MtlsConfig, storage: CertStorage, clock: &dyn Clock) -> Result<Self> {
        let key = KeyPairGenerator::generate(config.ca_key_algorithm)?;
        let now = clock.now();
        let params = RootTemplate {
            common_name: &config.ca_common_name,
            not_before: now,
            not_after: now + Duration::days(i64::from(config.ca_validity_days)),
        }
        .to_params()?;
        let cert = params
            .self_signed(key.as_rcgen())
            .map_err(|e| Error::Signing(format!("CA cert generation failed: {e}")))?;
        let certificate_pem = cert.pem();
        let info = CertificateCodec::decode(&certificate_pem)?;

        storage.write_authority(&key.private_key_pem(), &certificate_pem)?;
        storage.write_serial(FIRST_SERIAL)?;

        info!(
            root = %storage.root().display(),
            algorithm = %config.ca_key_algorithm,
            "Generated new certificate authority"
        );
        audit::emit(&AuditEvent::ca_created(&info));

        Ok(Self {
            key,
            certificate_pem,
            info,
            next_serial: Mutex::new(FIRST_SERIAL),
            storage,
        })
    }

    /// PEM of the self-signed root.
    #[must_use]
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Decoded root certificate.
    #[must_use]
    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }

    /// Subject Common Name of the root.
    #[must_use]
    pub fn common_name(&self) -> &str {
        &self.info.subject.common_name
    }

    /// Storage the authority was loaded from.
    #[must_use]
    pub fn storage(&self) -> &CertStorage {
        &self.storage
    }

    /// The serial the next issuance will receive.
    #[must_use]
    pub fn peek_next_serial(&self) -> u64 {
        *self.next_serial.lock()
    }

    /// Take the current serial and advance the counter (post-increment).
    ///
    /// The advanced counter is persisted before the serial is handed out, so
    /// a serial is never reused even if the caller later fails.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the counter cannot be written; the
    /// in-memory counter is left unchanged in that case.
    pub fn allocate_serial(&self) -> Result<u64> {
        let mut next = self.next_serial.lock();
        let serial = *next;
        let advanced = serial
            .checked_add(1)
            .ok_or_else(|| Error::Internal("CA serial counter exhausted".to_string()))?;
        self.storage.write_serial(advanced)?;
        *next = advanced;
        Ok(serial)
    }

    /// Sign a leaf certificate for `subject_key`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateEncoding` for an unencodable template or
    /// `Error::Signing` if the authority cannot sign.
    pub fn sign_leaf(&self, template: &LeafTemplate<'_>, subject_key: &KeyPair) -> Result<String> {
        let params = template.to_params()?;
        let issuer = rcgen::Issuer::from_ca_cert_pem(&self.certificate_pem, self.key.as_rcgen())
            .map_err(|e| Error::Signing(format!("Failed to load CA as issuer: {e}")))?;
        let cert = params
            .signed_by(subject_key.as_rcgen(), &issuer)
            .map_err(|e| Error::Signing(format!("Leaf cert signing failed: {e}")))?;
        Ok(cert.pem())
    }

    /// Verify that `cert` was signed by this authority's key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Signing` if the signature does not verify.
    pub fn verify_issued(&self, cert: &CertificateInfo) -> Result<()> {
        CertificateCodec::verify_signature(cert, &self.info)
    }
}

/// Next serial after the highest one found in agent directories.
fn recover_serial(storage: &CertStorage) -> u64 {
    let highest_issued = storage
        .read_agents()
        .unwrap_or_default()
        .iter()
        .filter_map(|files| CertificateCodec::decode(&files.cert_pem).ok())
        .map(|info| info.serial_number)
        .chain(storage.read_revoked().unwrap_or_default())
        .max();
    highest_issued.map_or(FIRST_SERIAL, |s| s.saturating_add(1))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

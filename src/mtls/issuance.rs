//! Agent certificate issuance, reuse, revocation and status reporting.
//!
//! Issuance is synchronous and CPU-bound (key generation + signing). Async
//! callers go through [`crate::mtls::CertificateManager`], which runs it on a
//! bounded blocking pool.

use std::sync::Arc;

use chrono::Duration;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::mtls::audit::{self, AuditEvent};
use crate::mtls::authority::CertificateAuthority;
use crate::mtls::clock::Clock;
use crate::mtls::codec::{CertificateCodec, LeafTemplate};
use crate::mtls::config::MtlsConfig;
use crate::mtls::keys::{KeyAlgorithm, KeyPairGenerator};
use crate::mtls::record::{AgentCertificate, AgentInfo, CertificateStatus, PrivateKeyPem};
use crate::mtls::store::{CertificateStore, validate_agent_id};
use crate::{Error, Result};

/// Issues and revokes agent certificates.
pub struct IssuanceService {
    authority: Arc<CertificateAuthority>,
    store: Arc<CertificateStore>,
    clock: Arc<dyn Clock>,
    validity: Duration,
    san_domain: String,
    key_algorithm: KeyAlgorithm,
    /// One lock per agent: concurrent `issue`/`revoke` for the same agent run
    /// one at a time; different agents do not contend. Entries only live
    /// while some call for that agent is in flight.
    agent_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IssuanceService {
    /// Create the service.
    #[must_use]
    pub fn new(
        config: &MtlsConfig,
        authority: Arc<CertificateAuthority>,
        store: Arc<CertificateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            authority,
            store,
            clock,
            validity: Duration::days(i64::from(config.certificate_validity_days)),
            san_domain: config.san_domain.clone(),
            key_algorithm: config.agent_key_algorithm,
            agent_locks: DashMap::new(),
        }
    }

    /// Issue a certificate for `agent_id`, or return the current one if it
    /// has not expired yet.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidAgentId` for an unusable id, otherwise
    /// `Error::Issuance` wrapping the key generation, encoding, signing or
    /// persistence failure. The store is unchanged on error.
    pub fn issue(&self, agent_id: &str, agent_info: &AgentInfo) -> Result<AgentCertificate> {
        validate_agent_id(agent_id)?;

        let lock = self.agent_lock(agent_id);
        let result = {
            let _guard = lock.lock();
            self.issue_locked(agent_id, agent_info)
        };
        self.release_lock(agent_id, &lock);
        result
    }

    fn issue_locked(&self, agent_id: &str, agent_info: &AgentInfo) -> Result<AgentCertificate> {
        let now = self.clock.now();
        if let Some(existing) = self.store.get(agent_id) {
            if existing.expires_at > now {
                debug!(agent_id, serial = existing.serial_number, "Reusing unexpired certificate");
                audit::emit(&AuditEvent::reused(&existing));
                return Ok(existing);
            }
            info!(agent_id, serial = existing.serial_number, "Existing certificate expired; reissuing");
        }

        match self.mint(agent_id, agent_info) {
            Ok((record, fingerprint)) => {
                audit::emit(&AuditEvent::issued(&record, fingerprint));
                Ok(record)
            }
            Err(e) => {
                audit::emit(&AuditEvent::issue_failed(agent_id, e.kind()));
                Err(Error::issuance(agent_id, e))
            }
        }
    }

    fn mint(&self, agent_id: &str, agent_info: &AgentInfo) -> Result<(AgentCertificate, String)> {
        let agent_key = KeyPairGenerator::generate(self.key_algorithm)?;

        let issued_at = self.clock.now();
        let expires_at = issued_at + self.validity;
        if expires_at > self.authority.info().not_after {
            warn!(
                agent_id,
                expires_at = %expires_at,
                ca_not_after = %self.authority.info().not_after,
                "Agent certificate outlives the root; peers will reject it once the root expires"
            );
        }
        let subject = agent_info.subject_for(agent_id);
        let san_dns = self.san_dns_for(agent_id);
        let serial_number = self.authority.allocate_serial()?;

        let certificate_pem = self.authority.sign_leaf(
            &LeafTemplate {
                subject: &subject,
                san_dns: &san_dns,
                serial_number,
                not_before: issued_at,
                not_after: expires_at,
            },
            &agent_key,
        )?;
        let fingerprint = CertificateCodec::decode(&certificate_pem)?.fingerprint();

        let record = AgentCertificate {
            agent_id: agent_id.to_string(),
            private_key: PrivateKeyPem::new(agent_key.private_key_pem()),
            certificate_pem,
            ca_certificate_pem: self.authority.certificate_pem().to_string(),
            issued_at,
            expires_at,
            serial_number,
        };
        self.store.persist_and_insert(record.clone())?;
        Ok((record, fingerprint))
    }

    /// Revoke the certificate of `agent_id`. Returns `false` if the agent had
    /// none.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the revocation cannot be made durable.
    pub fn revoke(&self, agent_id: &str) -> Result<bool> {
        validate_agent_id(agent_id)?;

        let lock = self.agent_lock(agent_id);
        let revoked = {
            let _guard = lock.lock();
            self.store.revoke(agent_id)
        };
        self.release_lock(agent_id, &lock);

        let revoked = revoked?;
        let serial = revoked.as_ref().map(|r| r.serial_number);
        if revoked.is_some() {
            info!(agent_id, serial, "Certificate revoked");
        }
        audit::emit(&AuditEvent::revoked(agent_id, serial));
        Ok(revoked.is_some())
    }

    /// Status of the current certificate of `agent_id`, if any.
    #[must_use]
    pub fn status(&self, agent_id: &str) -> Option<CertificateStatus> {
        let now = self.clock.now();
        self.store.get(agent_id).map(|cert| cert.status_at(now))
    }

    /// Status of every current certificate, sorted by agent id.
    #[must_use]
    pub fn list_statuses(&self) -> Vec<CertificateStatus> {
        let now = self.clock.now();
        self.store
            .records()
            .iter()
            .map(|cert| cert.status_at(now))
            .collect()
    }

    /// DNS SAN entries for an agent: the bare id and `<id>.<san_domain>`.
    fn san_dns_for(&self, agent_id: &str) -> Vec<String> {
        let mut sans = vec![agent_id.to_string()];
        if !self.san_domain.is_empty() {
            sans.push(format!("{agent_id}.{}", self.san_domain));
        }
        sans
    }

    fn agent_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        self.agent_locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the map entry once nobody but the map and this caller holds it.
    /// Must be called after the guard is released.
    fn release_lock(&self, agent_id: &str, lock: &Arc<Mutex<()>>) {
        self.agent_locks
            .remove_if(agent_id, |_, held| Arc::ptr_eq(held, lock) && Arc::strong_count(held) == 2);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

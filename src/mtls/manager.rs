//! Async entry point to the certificate subsystem.
//!
//! Key generation and signing are CPU-bound, so `issue` and `revoke` run on
//! tokio's blocking pool, gated by a semaphore sized from
//! `max_concurrent_issuance`. Everything else is cheap and runs inline.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::info;

use crate::mtls::authority::CertificateAuthority;
use crate::mtls::clock::{Clock, SystemClock};
use crate::mtls::codec::CertificateInfo;
use crate::mtls::config::MtlsConfig;
use crate::mtls::issuance::IssuanceService;
use crate::mtls::record::{AgentCertificate, AgentInfo, CertificateStatus};
use crate::mtls::storage::CertStorage;
use crate::mtls::store::CertificateStore;
use crate::mtls::tls::{TlsContextFactory, TransportSecurityContext};
use crate::mtls::validation::{ValidationFailure, ValidationService};
use crate::{Error, Result};

/// Owns the authority, the store and the services built on them.
pub struct CertificateManager {
    authority: Arc<CertificateAuthority>,
    store: Arc<CertificateStore>,
    issuance: Arc<IssuanceService>,
    validation: ValidationService,
    /// Concurrency limiter for blocking crypto work. Permits are owned by the
    /// blocking job, so a dropped caller does not free one early.
    semaphore: Arc<Semaphore>,
}

impl CertificateManager {
    /// Open the subsystem rooted at `config.cert_path` using wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for invalid configuration or unusable
    /// authority material.
    pub fn open(config: &MtlsConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open with an explicit time source.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_with_clock(config: &MtlsConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let storage = CertStorage::open(config.resolved_cert_path())?;
        let authority = Arc::new(CertificateAuthority::load_or_create(
            config,
            storage.clone(),
            clock.as_ref(),
        )?);
        let store = Arc::new(CertificateStore::open(storage)?);
        let issuance = Arc::new(IssuanceService::new(
            config,
            Arc::clone(&authority),
            Arc::clone(&store),
            Arc::clone(&clock),
        ));
        let validation = ValidationService::new(Arc::clone(&authority), Arc::clone(&store), clock);

        info!(
            root = %authority.storage().root().display(),
            ca = %authority.common_name(),
            agents = store.len(),
            "Certificate manager ready"
        );

        Ok(Self {
            authority,
            store,
            issuance,
            validation,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_issuance)),
        })
    }

    /// The trust root.
    #[must_use]
    pub fn authority(&self) -> &CertificateAuthority {
        &self.authority
    }

    /// The certificate store.
    #[must_use]
    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    /// Issue (or reuse) the certificate for `agent_id`.
    ///
    /// # Errors
    ///
    /// See [`IssuanceService::issue`].
    pub async fn issue(&self, agent_id: &str, agent_info: AgentInfo) -> Result<AgentCertificate> {
        let issuance = Arc::clone(&self.issuance);
        let agent_id = agent_id.to_string();
        self.run_blocking(move || issuance.issue(&agent_id, &agent_info))
            .await
    }

    /// Revoke the certificate of `agent_id`.
    ///
    /// # Errors
    ///
    /// See [`IssuanceService::revoke`].
    pub async fn revoke(&self, agent_id: &str) -> Result<bool> {
        let issuance = Arc::clone(&self.issuance);
        let agent_id = agent_id.to_string();
        self.run_blocking(move || issuance.revoke(&agent_id)).await
    }

    /// `true` if `certificate_pem` is currently valid for `agent_id`.
    ///
    /// Inclusive at `expires_at`; see [`ValidationService::validate`].
    #[must_use]
    pub fn validate(&self, certificate_pem: impl AsRef<[u8]>, agent_id: &str) -> bool {
        self.validation.validate(certificate_pem, agent_id)
    }

    /// Validation with the rejection reason.
    pub fn check(
        &self,
        certificate_pem: impl AsRef<[u8]>,
        agent_id: &str,
    ) -> std::result::Result<CertificateInfo, ValidationFailure> {
        self.validation.check(certificate_pem, agent_id)
    }

    /// Status of the certificate held for `agent_id`.
    #[must_use]
    pub fn status(&self, agent_id: &str) -> Option<CertificateStatus> {
        self.issuance.status(agent_id)
    }

    /// Status of every held certificate, sorted by agent id.
    #[must_use]
    pub fn list_statuses(&self) -> Vec<CertificateStatus> {
        self.issuance.list_statuses()
    }

    /// Certificate held for `agent_id`, including its key.
    #[must_use]
    pub fn certificate(&self, agent_id: &str) -> Option<AgentCertificate> {
        self.store.get(agent_id)
    }

    /// rustls material for `cert`.
    ///
    /// # Errors
    ///
    /// See [`TlsContextFactory::build`].
    pub fn build_transport_context(&self, cert: &AgentCertificate) -> Result<TransportSecurityContext> {
        TlsContextFactory::build(cert)
    }

    async fn run_blocking<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("Issuance limiter closed".to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
            .map_err(|e| Error::Internal(format!("Issuance task failed: {e}")))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::mtls::clock::ManualClock;
    use crate::mtls::record::StatusKind;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_760_000_000, 0).unwrap()
    }

    fn config(dir: &std::path::Path) -> MtlsConfig {
        MtlsConfig {
            certificate_validity_days: 30,
            max_concurrent_issuance: 2,
            ..MtlsConfig::with_cert_path(dir)
        }
    }

    #[tokio::test]
    async fn issue_validate_revoke_through_facade() {
        // GIVEN: a manager on simulated time
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let manager = CertificateManager::open_with_clock(&config(dir.path()), clock).unwrap();
        // WHEN: issuing
        let cert = manager.issue("agent-1", AgentInfo::default()).await.unwrap();
        // THEN: validates, reports status, then stops validating once revoked
        assert!(manager.validate(&cert.certificate_pem, "agent-1"));
        assert_eq!(manager.status("agent-1").unwrap().status, StatusKind::Valid);
        assert!(manager.revoke("agent-1").await.unwrap());
        assert!(manager.status("agent-1").is_none());
        assert!(!manager.validate(&cert.certificate_pem, "agent-1"));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("certs");
        let bad = MtlsConfig {
            certificate_validity_days: 0,
            ..MtlsConfig::with_cert_path(&root)
        };
        let err = CertificateManager::open(&bad).err().unwrap();
        assert_eq!(err.kind(), "configuration");
        assert!(!root.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_issues_share_one_certificate_per_agent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(CertificateManager::open(&config(dir.path())).unwrap());

        let mut handles = Vec::new();
        for i in 0..12 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                let agent = format!("agent-{}", i % 3);
                manager.issue(&agent, AgentInfo::default()).await.unwrap()
            }));
        }
        let mut certs = Vec::new();
        for handle in handles {
            certs.push(handle.await.unwrap());
        }

        assert_eq!(manager.list_statuses().len(), 3);
        for cert in &certs {
            assert_eq!(&manager.certificate(&cert.agent_id).unwrap(), cert);
        }
        assert_eq!(manager.authority().peek_next_serial(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn permit_stays_taken_until_blocking_job_returns() {
        // GIVEN: a job parked on the blocking pool
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(CertificateManager::open(&config(dir.path())).unwrap());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let caller = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .run_blocking(move || {
                        let _ = started_tx.send(());
                        let _ = release_rx.recv();
                        Ok(())
                    })
                    .await
            })
        };
        started_rx.await.unwrap();
        assert_eq!(manager.semaphore.available_permits(), 1);

        // WHEN: the caller is dropped while the job still runs
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        // THEN: the permit is held by the job, and only returned once it ends
        assert_eq!(manager.semaphore.available_permits(), 1);
        release_tx.send(()).unwrap();
        for _ in 0..200 {
            if manager.semaphore.available_permits() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(manager.semaphore.available_permits(), 2);
    }

    #[tokio::test]
    async fn issued_certificate_expires_and_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let manager =
            CertificateManager::open_with_clock(&config(dir.path()), clock.clone()).unwrap();
        let first = manager.issue("agent-1", AgentInfo::default()).await.unwrap();

        clock.advance(Duration::days(31));
        assert!(!manager.validate(&first.certificate_pem, "agent-1"));

        let second = manager.issue("agent-1", AgentInfo::default()).await.unwrap();
        assert!(second.serial_number > first.serial_number);
        assert!(manager.validate(&second.certificate_pem, "agent-1"));
    }

    #[tokio::test]
    async fn transport_context_is_available_for_issued_agent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CertificateManager::open(&config(dir.path())).unwrap();
        let cert = manager.issue("agent-1", AgentInfo::default()).await.unwrap();
        let ctx = manager.build_transport_context(&cert).unwrap();
        assert_eq!(ctx.agent_id(), "agent-1");
    }
}

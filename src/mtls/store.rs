//! Certificate store — current certificate per agent, backed by disk.
//!
//! # Design
//!
//! Records live in a `DashMap` keyed by agent id, so a reader always sees a
//! whole record (never a half-written one) and reads for one agent do not
//! contend with writes for another. Every mutation hits disk first; memory
//! is only updated once the files are durable.
//!
//! Revocation is local: revoked serials go into a ledger that this store
//! (and any process sharing `cert_path`) consults. There is no CRL or OCSP
//! responder.

use std::collections::BTreeSet;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::mtls::codec::CertificateCodec;
use crate::mtls::record::{AgentCertificate, PrivateKeyPem};
use crate::mtls::storage::{self, AgentFiles, CertStorage};
use crate::{Error, Result};

/// In-memory map of agent id → current certificate, mirrored on disk.
#[derive(Debug)]
pub struct CertificateStore {
    records: DashMap<String, AgentCertificate>,
    revoked: RwLock<BTreeSet<u64>>,
    storage: CertStorage,
}

impl CertificateStore {
    /// Open the store, loading every agent directory under `storage`.
    ///
    /// Directories whose certificate does not decode, or whose serial is in
    /// the revocation ledger, are skipped (revoked ones are deleted).
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the storage root or the revocation ledger
    /// cannot be read.
    pub fn open(storage: CertStorage) -> Result<Self> {
        let revoked = storage.read_revoked()?;
        let records = DashMap::new();

        for files in storage.read_agents()? {
            let info = match CertificateCodec::decode(&files.cert_pem) {
                Ok(info) => info,
                Err(e) => {
                    warn!(agent_id = %files.agent_id, error = %e, "Skipping agent with undecodable certificate");
                    continue;
                }
            };
            if revoked.contains(&info.serial_number) {
                warn!(
                    agent_id = %files.agent_id,
                    serial = info.serial_number,
                    "Discarding files of a revoked certificate"
                );
                let _ = storage.remove_agent(&files.agent_id);
                continue;
            }
            if info.subject.common_name != files.agent_id {
                warn!(agent_id = %files.agent_id, cn = %info.subject.common_name, "Skipping agent directory with mismatched subject");
                continue;
            }
            let record = AgentCertificate {
                agent_id: files.agent_id.clone(),
                private_key: PrivateKeyPem::new(files.key_pem),
                certificate_pem: files.cert_pem,
                ca_certificate_pem: files.ca_cert_pem,
                issued_at: info.not_before,
                expires_at: info.not_after,
                serial_number: info.serial_number,
            };
            records.insert(files.agent_id, record);
        }

        info!(
            root = %storage.root().display(),
            agents = records.len(),
            revoked = revoked.len(),
            "Certificate store loaded"
        );

        Ok(Self {
            records,
            revoked: RwLock::new(revoked),
            storage,
        })
    }

    /// Current certificate for `agent_id`.
    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<AgentCertificate> {
        self.records.get(agent_id).map(|entry| entry.value().clone())
    }

    /// Whether `agent_id` has a current certificate.
    #[must_use]
    pub fn contains(&self, agent_id: &str) -> bool {
        self.records.contains_key(agent_id)
    }

    /// Write the record's files, then insert/replace it in memory.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the files cannot be written; memory
    /// is not touched in that case.
    pub fn persist_and_insert(&self, record: AgentCertificate) -> Result<()> {
        self.storage.write_agent(&AgentFiles {
            agent_id: record.agent_id.clone(),
            key_pem: record.private_key.expose().to_string(),
            cert_pem: record.certificate_pem.clone(),
            ca_cert_pem: record.ca_certificate_pem.clone(),
        })?;
        debug!(agent_id = %record.agent_id, serial = record.serial_number, "Stored agent certificate");
        self.records.insert(record.agent_id.clone(), record);
        Ok(())
    }

    /// Revoke and remove the record for `agent_id`. No-op (`Ok(None)`) if absent.
    ///
    /// The serial is written to the revocation ledger before anything else.
    /// Once that write succeeds the record leaves memory, and a failure to
    /// delete the agent directory is only logged: the directory is discarded
    /// on the next open because its serial is in the ledger.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the ledger cannot be appended, or if
    /// a stray directory of an agent without a record cannot be removed.
    pub fn revoke(&self, agent_id: &str) -> Result<Option<AgentCertificate>> {
        let Some(record) = self.get(agent_id) else {
            // Nothing in memory; still clear any stray directory.
            self.storage.remove_agent(agent_id)?;
            return Ok(None);
        };

        self.storage.append_revoked(record.serial_number)?;
        self.revoked.write().insert(record.serial_number);
        self.records.remove(agent_id);
        if let Err(e) = self.storage.remove_agent(agent_id) {
            warn!(
                agent_id,
                serial = record.serial_number,
                error = %e,
                "Revoked certificate files could not be removed"
            );
        }
        Ok(Some(record))
    }

    /// Whether `serial` has been revoked.
    #[must_use]
    pub fn is_revoked(&self, serial: u64) -> bool {
        self.revoked.read().contains(&serial)
    }

    /// Snapshot of every record, sorted by agent id.
    #[must_use]
    pub fn records(&self) -> Vec<AgentCertificate> {
        let mut all: Vec<AgentCertificate> =
            self.records.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    /// Number of agents with a current certificate.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` if no agent has a certificate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Validate an agent id for use as a store key, CN and directory name.
///
/// Accepts ASCII letters, digits, `-`, `_` and `.`, not starting with `.`,
/// at most 64 characters (the X.520 Common Name upper bound). Names of the
/// authority's own files under the storage root (`ca-key.pem`,
/// `ca-cert.pem`, `ca-serial`, `revoked-serials`, `*.tmp`) are refused.
///
/// # Errors
///
/// Returns `Error::InvalidAgentId` otherwise.
pub fn validate_agent_id(agent_id: &str) -> Result<()> {
    let valid = !agent_id.is_empty()
        && agent_id.len() <= 64
        && !agent_id.starts_with('.')
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !storage::is_reserved_name(agent_id);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidAgentId(agent_id.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{Duration, Utc};

    use super::*;

    fn record(agent_id: &str, serial: u64) -> AgentCertificate {
        let now = Utc::now();
        AgentCertificate {
            agent_id: agent_id.to_string(),
            private_key: PrivateKeyPem::new("key".to_string()),
            certificate_pem: format!("cert-{serial}"),
            ca_certificate_pem: "ca".to_string(),
            issued_at: now,
            expires_at: now + Duration::days(1),
            serial_number: serial,
        }
    }

    #[test]
    fn insert_then_get_returns_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::open(CertStorage::open(dir.path()).unwrap()).unwrap();
        store.persist_and_insert(record("agent-1", 1)).unwrap();

        assert!(store.contains("agent-1"));
        assert_eq!(store.get("agent-1").unwrap().serial_number, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn failed_persistence_leaves_memory_untouched() {
        // GIVEN: a store whose root was replaced by a plain file
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("certs");
        let store = CertificateStore::open(CertStorage::open(&root).unwrap()).unwrap();
        fs::remove_dir_all(&root).unwrap();
        fs::write(&root, b"not a dir").unwrap();
        // WHEN: inserting
        let result = store.persist_and_insert(record("agent-1", 1));
        // THEN: error and no in-memory record
        assert!(result.is_err());
        assert!(!store.contains("agent-1"));
    }

    #[test]
    fn revoke_absent_agent_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::open(CertStorage::open(dir.path()).unwrap()).unwrap();
        assert!(store.revoke("ghost").unwrap().is_none());
    }

    #[test]
    fn revoke_removes_record_and_files_and_records_serial() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::open(CertStorage::open(dir.path()).unwrap()).unwrap();
        store.persist_and_insert(record("agent-1", 4)).unwrap();

        let revoked = store.revoke("agent-1").unwrap().unwrap();
        assert_eq!(revoked.serial_number, 4);
        assert!(!store.contains("agent-1"));
        assert!(!dir.path().join("agent-1").exists());
        assert!(store.is_revoked(4));
        assert!(!store.is_revoked(5));
    }

    #[test]
    fn revoke_drops_record_even_when_files_cannot_be_removed() {
        // GIVEN: a stored agent whose directory was replaced by a plain file
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::open(CertStorage::open(dir.path()).unwrap()).unwrap();
        store.persist_and_insert(record("agent-1", 7)).unwrap();
        let agent_dir = dir.path().join("agent-1");
        fs::remove_dir_all(&agent_dir).unwrap();
        fs::write(&agent_dir, b"not a dir").unwrap();

        // WHEN: revoking
        let revoked = store.revoke("agent-1").unwrap();

        // THEN: the ledger and memory agree even though the file is still there
        assert_eq!(revoked.unwrap().serial_number, 7);
        assert!(store.is_revoked(7));
        assert!(!store.contains("agent-1"));
        assert!(agent_dir.exists());
        let ledger = fs::read_to_string(dir.path().join(storage::REVOKED_FILE)).unwrap();
        assert!(ledger.lines().any(|l| l.trim() == "7"));
    }

    #[test]
    fn revoke_fails_without_touching_memory_when_ledger_is_unwritable() {
        // GIVEN: the ledger path is occupied by a directory
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::open(CertStorage::open(dir.path()).unwrap()).unwrap();
        store.persist_and_insert(record("agent-1", 3)).unwrap();
        fs::create_dir(dir.path().join(storage::REVOKED_FILE)).unwrap();

        // WHEN/THEN: revoke fails and the record stays current
        assert!(store.revoke("agent-1").is_err());
        assert!(store.contains("agent-1"));
        assert!(!store.is_revoked(3));
    }

    #[test]
    fn reserved_storage_names_are_not_agent_ids() {
        for reserved in [
            storage::CA_KEY_FILE,
            storage::CA_CERT_FILE,
            storage::CA_SERIAL_FILE,
            storage::REVOKED_FILE,
            "ca-serial.tmp",
            "agent-1.tmp",
        ] {
            assert!(
                matches!(validate_agent_id(reserved), Err(Error::InvalidAgentId(_))),
                "{reserved} should be rejected"
            );
        }
    }

    #[test]
    fn records_are_sorted_by_agent_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::open(CertStorage::open(dir.path()).unwrap()).unwrap();
        store.persist_and_insert(record("zeta", 1)).unwrap();
        store.persist_and_insert(record("alpha", 2)).unwrap();
        let ids: Vec<String> = store.records().into_iter().map(|r| r.agent_id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[test]
    fn undecodable_agent_files_are_skipped_on_open() {
        // Records written by the fixtures above are not real certificates
        let dir = tempfile::tempdir().unwrap();
        let storage = CertStorage::open(dir.path()).unwrap();
        let store = CertificateStore::open(storage.clone()).unwrap();
        store.persist_and_insert(record("agent-1", 1)).unwrap();
        drop(store);

        let reopened = CertificateStore::open(storage).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn agent_id_rules() {
        for ok in ["agent-1", "a", "svc_payments.v2", "A-B_C.d"] {
            assert!(validate_agent_id(ok).is_ok(), "{ok} should be valid");
        }
        let too_long = "x".repeat(65);
        for bad in ["", ".hidden", "../etc", "a/b", "a b", "ägent", too_long.as_str()] {
            assert!(validate_agent_id(bad).is_err(), "{bad} should be invalid");
        }
    }
}

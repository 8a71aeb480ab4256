//! Durable certificate storage layout.
//!
//! ```text
//! <cert_path>/
//!   ca-key.pem          authority private key (0600)
//!   ca-cert.pem         self-signed root
//!   ca-serial           next serial number to allocate
//!   revoked-serials     one revoked serial per line
//!   <agent_id>/
//!     agent-key.pem     agent private key (0600)
//!     agent-cert.pem    leaf certificate signed by the root
//!     ca-cert.pem       copy of the root for the agent's own chain checks
//! ```
//!
//! Every write goes through a scoped file handle that is flushed and synced
//! before it is dropped. Agent directories are staged under a hidden name and
//! renamed into place only once all three files are on disk.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{Error, Result};

/// Authority private key file.
pub const CA_KEY_FILE: &str = "ca-key.pem";
/// Authority certificate file.
pub const CA_CERT_FILE: &str = "ca-cert.pem";
/// Serial counter file.
pub const CA_SERIAL_FILE: &str = "ca-serial";
/// Revoked serial ledger.
pub const REVOKED_FILE: &str = "revoked-serials";
/// Agent private key file.
pub const AGENT_KEY_FILE: &str = "agent-key.pem";
/// Agent certificate file.
pub const AGENT_CERT_FILE: &str = "agent-cert.pem";

const STAGING_PREFIX: &str = ".staging-";
const TMP_SUFFIX: &str = ".tmp";

/// `true` if `name` is taken by the authority's own files under the root and
/// therefore cannot name an agent directory.
#[must_use]
pub fn is_reserved_name(name: &str) -> bool {
    [CA_KEY_FILE, CA_CERT_FILE, CA_SERIAL_FILE, REVOKED_FILE].contains(&name)
        || name.ends_with(TMP_SUFFIX)
        || name.starts_with(STAGING_PREFIX)
}

/// The three PEM files kept for one agent.
#[derive(Debug, Clone)]
pub struct AgentFiles {
    /// Directory name (the agent id).
    pub agent_id: String,
    /// `agent-key.pem`
    pub key_pem: String,
    /// `agent-cert.pem`
    pub cert_pem: String,
    /// `ca-cert.pem`
    pub ca_cert_pem: String,
}

/// Filesystem root for the authority and per-agent material.
#[derive(Debug, Clone)]
pub struct CertStorage {
    root: PathBuf,
}

impl CertStorage {
    /// Open (creating if needed) the storage root.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the root cannot be created or is not a
    /// directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if root.exists() && !root.is_dir() {
            return Err(Error::Config(format!(
                "Certificate path '{}' is not a directory",
                root.display()
            )));
        }
        fs::create_dir_all(&root).map_err(|e| {
            Error::Config(format!(
                "Cannot create certificate dir '{}': {e}",
                root.display()
            ))
        })?;
        restrict_dir(&root);
        Ok(Self { root })
    }

    /// Storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/ca-key.pem`
    #[must_use]
    pub fn ca_key_path(&self) -> PathBuf {
        self.root.join(CA_KEY_FILE)
    }

    /// `<root>/ca-cert.pem`
    #[must_use]
    pub fn ca_cert_path(&self) -> PathBuf {
        self.root.join(CA_CERT_FILE)
    }

    /// `<root>/<agent_id>`
    #[must_use]
    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.root.join(agent_id)
    }

    // ── authority ────────────────────────────────────────────────────────────

    /// Write the authority key and certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if either file cannot be written.
    pub fn write_authority(&self, key_pem: &str, cert_pem: &str) -> Result<()> {
        write_file(&self.ca_key_path(), key_pem.as_bytes(), true)?;
        write_file(&self.ca_cert_path(), cert_pem.as_bytes(), false)
    }

    /// Read the next serial, if a counter file exists.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file exists but does not hold an integer.
    pub fn read_serial(&self) -> Result<Option<u64>> {
        let path = self.root.join(CA_SERIAL_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = read_to_string(&path)?;
        text.trim().parse::<u64>().map(Some).map_err(|e| {
            Error::Config(format!(
                "Corrupt serial counter '{}': {e}",
                path.display()
            ))
        })
    }

    /// Persist the next serial. Written to a temp file then renamed so a crash
    /// never leaves a truncated counter.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` on any write failure.
    pub fn write_serial(&self, next: u64) -> Result<()> {
        let path = self.root.join(CA_SERIAL_FILE);
        let tmp = self.root.join(format!("{CA_SERIAL_FILE}{TMP_SUFFIX}"));
        write_file(&tmp, format!("{next}\n").as_bytes(), false)?;
        fs::rename(&tmp, &path).map_err(|e| {
            Error::Persistence(format!("Cannot replace '{}': {e}", path.display()))
        })
    }

    // ── revocation ledger ────────────────────────────────────────────────────

    /// Load the revoked serial ledger.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the ledger contains a non-integer line.
    pub fn read_revoked(&self) -> Result<BTreeSet<u64>> {
        let path = self.root.join(REVOKED_FILE);
        if !path.exists() {
            return Ok(BTreeSet::new());
        }
        read_to_string(&path)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.parse::<u64>().map_err(|e| {
                    Error::Config(format!("Corrupt revocation ledger entry '{line}': {e}"))
                })
            })
            .collect()
    }

    /// Append a serial to the revoked ledger.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the ledger cannot be appended to.
    pub fn append_revoked(&self, serial: u64) -> Result<()> {
        let path = self.root.join(REVOKED_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| persistence(&path, &e))?;
        writeln!(file, "{serial}").map_err(|e| persistence(&path, &e))?;
        file.sync_all().map_err(|e| persistence(&path, &e))
    }

    // ── agents ───────────────────────────────────────────────────────────────

    /// Write an agent's key, certificate and CA copy, replacing any previous
    /// directory. Either all three files land or the old directory is left
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` on any write or rename failure; the
    /// staging directory is removed before returning.
    pub fn write_agent(&self, files: &AgentFiles) -> Result<()> {
        let staging = self.root.join(format!(
            "{STAGING_PREFIX}{}-{}",
            files.agent_id,
            uuid::Uuid::new_v4().simple()
        ));

        if let Err(e) = stage_agent(&staging, files) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let target = self.agent_dir(&files.agent_id);
        if target.exists() {
            if let Err(e) = fs::remove_dir_all(&target) {
                let _ = fs::remove_dir_all(&staging);
                return Err(persistence(&target, &e));
            }
        }
        if let Err(e) = fs::rename(&staging, &target) {
            let _ = fs::remove_dir_all(&staging);
            return Err(persistence(&target, &e));
        }

        debug!(agent_id = %files.agent_id, dir = %target.display(), "Agent certificate files written");
        Ok(())
    }

    /// Delete an agent's directory. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the directory exists but cannot be removed.
    pub fn remove_agent(&self, agent_id: &str) -> Result<bool> {
        let dir = self.agent_dir(agent_id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).map_err(|e| persistence(&dir, &e))?;
        Ok(true)
    }

    /// Read every agent directory under the root.
    ///
    /// Leftover staging directories are removed. Directories with missing or
    /// unreadable files are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the root itself cannot be listed.
    pub fn read_agents(&self) -> Result<Vec<AgentFiles>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            Error::Config(format!("Cannot list '{}': {e}", self.root.display()))
        })?;

        let mut agents = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
                continue;
            };
            if name.starts_with(STAGING_PREFIX) {
                warn!(dir = %path.display(), "Removing abandoned staging directory");
                let _ = fs::remove_dir_all(&path);
                continue;
            }
            match read_agent_dir(&path, &name) {
                Ok(files) => agents.push(files),
                Err(e) => warn!(agent_id = %name, error = %e, "Skipping unreadable agent directory"),
            }
        }
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(agents)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn stage_agent(staging: &Path, files: &AgentFiles) -> Result<()> {
    fs::create_dir_all(staging).map_err(|e| persistence(staging, &e))?;
    restrict_dir(staging);
    write_file(&staging.join(AGENT_KEY_FILE), files.key_pem.as_bytes(), true)?;
    write_file(&staging.join(AGENT_CERT_FILE), files.cert_pem.as_bytes(), false)?;
    write_file(&staging.join(CA_CERT_FILE), files.ca_cert_pem.as_bytes(), false)
}

fn read_agent_dir(dir: &Path, agent_id: &str) -> Result<AgentFiles> {
    Ok(AgentFiles {
        agent_id: agent_id.to_string(),
        key_pem: read_to_string(&dir.join(AGENT_KEY_FILE))?,
        cert_pem: read_to_string(&dir.join(AGENT_CERT_FILE))?,
        ca_cert_pem: read_to_string(&dir.join(CA_CERT_FILE))?,
    })
}

/// Create/truncate `path`, write `contents`, fsync. The handle is dropped
/// (closed) on every path out of this function.
fn write_file(path: &Path, contents: &[u8], secret: bool) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if secret {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = secret;

    let mut file: File = options.open(path).map_err(|e| persistence(path, &e))?;
    file.write_all(contents).map_err(|e| persistence(path, &e))?;
    file.sync_all().map_err(|e| persistence(path, &e))
}

pub(crate) fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::Persistence(format!("Cannot read '{}': {e}", path.display())))
}

fn persistence(path: &Path, e: &std::io::Error) -> Error {
    Error::Persistence(format!("'{}': {e}", path.display()))
}

/// Owner-only access on the directory (best effort).
fn restrict_dir(dir: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
    }
    #[cfg(not(unix))]
    let _ = dir;
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn files(agent_id: &str, marker: &str) -> AgentFiles {
        AgentFiles {
            agent_id: agent_id.to_string(),
            key_pem: format!("key-{marker}"),
            cert_pem: format!("cert-{marker}"),
            ca_cert_pem: format!("ca-{marker}"),
        }
    }

    #[test]
    fn authority_file_names_are_reserved() {
        for name in [
            CA_KEY_FILE,
            CA_CERT_FILE,
            CA_SERIAL_FILE,
            REVOKED_FILE,
            "ca-serial.tmp",
            "anything.tmp",
        ] {
            assert!(is_reserved_name(name), "{name} should be reserved");
        }
        assert!(!is_reserved_name("agent-1"));
        assert!(!is_reserved_name("ca-cert.pem.v2"));
    }

    #[test]
    fn open_creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("certs");
        let storage = CertStorage::open(&root).unwrap();
        assert!(storage.root().is_dir());
    }

    #[test]
    fn open_rejects_a_file_as_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("certs");
        fs::write(&file, b"x").unwrap();
        let err = CertStorage::open(&file).unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn write_agent_creates_three_files() {
        // GIVEN: empty storage
        let dir = tempfile::tempdir().unwrap();
        let storage = CertStorage::open(dir.path()).unwrap();
        // WHEN: writing an agent
        storage.write_agent(&files("agent-1", "a")).unwrap();
        // THEN: the documented layout exists
        let agent_dir = dir.path().join("agent-1");
        assert_eq!(fs::read_to_string(agent_dir.join(AGENT_KEY_FILE)).unwrap(), "key-a");
        assert_eq!(fs::read_to_string(agent_dir.join(AGENT_CERT_FILE)).unwrap(), "cert-a");
        assert_eq!(fs::read_to_string(agent_dir.join(CA_CERT_FILE)).unwrap(), "ca-a");
    }

    #[cfg(unix)]
    #[test]
    fn agent_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let storage = CertStorage::open(dir.path()).unwrap();
        storage.write_agent(&files("agent-1", "a")).unwrap();
        let mode = fs::metadata(dir.path().join("agent-1").join(AGENT_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn write_agent_replaces_previous_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CertStorage::open(dir.path()).unwrap();
        storage.write_agent(&files("agent-1", "old")).unwrap();
        storage.write_agent(&files("agent-1", "new")).unwrap();

        let agents = storage.read_agents().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].cert_pem, "cert-new");
    }

    #[test]
    fn remove_agent_reports_whether_it_existed() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CertStorage::open(dir.path()).unwrap();
        storage.write_agent(&files("agent-1", "a")).unwrap();
        assert!(storage.remove_agent("agent-1").unwrap());
        assert!(!storage.remove_agent("agent-1").unwrap());
        assert!(!dir.path().join("agent-1").exists());
    }

    #[test]
    fn read_agents_skips_incomplete_dirs_and_cleans_staging() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CertStorage::open(dir.path()).unwrap();
        storage.write_agent(&files("good", "a")).unwrap();
        fs::create_dir(dir.path().join("broken")).unwrap();
        fs::create_dir(dir.path().join(".staging-x-123")).unwrap();

        let agents = storage.read_agents().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].agent_id, "good");
        assert!(!dir.path().join(".staging-x-123").exists());
    }

    #[test]
    fn serial_counter_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CertStorage::open(dir.path()).unwrap();
        assert_eq!(storage.read_serial().unwrap(), None);
        storage.write_serial(17).unwrap();
        assert_eq!(storage.read_serial().unwrap(), Some(17));
    }

    #[test]
    fn corrupt_serial_counter_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CertStorage::open(dir.path()).unwrap();
        fs::write(dir.path().join(CA_SERIAL_FILE), b"seventeen").unwrap();
        assert_eq!(storage.read_serial().unwrap_err().kind(), "configuration");
    }

    #[test]
    fn revoked_ledger_appends() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CertStorage::open(dir.path()).unwrap();
        storage.append_revoked(3).unwrap();
        storage.append_revoked(5).unwrap();
        let revoked = storage.read_revoked().unwrap();
        assert_eq!(revoked.into_iter().collect::<Vec<_>>(), vec![3, 5]);
    }
}

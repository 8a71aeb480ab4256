//! rustls configuration built from an agent certificate.
//!
//! A [`TransportSecurityContext`] bundles the agent's key, its certificate
//! chain and the authority as the only trust anchor. From it callers get a
//! server config that demands a client certificate from the same authority,
//! or a client config that presents the agent certificate.
//!
//! # File format
//!
//! Everything arrives as **PEM** text from the certificate record; nothing is
//! read from disk here.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use crate::mtls::record::AgentCertificate;
use crate::{Error, Result};

/// Builds [`TransportSecurityContext`]s.
pub struct TlsContextFactory;

impl TlsContextFactory {
    /// Parse the agent key, certificate and CA out of `cert`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Tls` if any of the PEM blocks cannot be parsed or the
    /// CA certificate is not an acceptable trust anchor.
    pub fn build(cert: &AgentCertificate) -> Result<TransportSecurityContext> {
        let leaf = CertificateDer::from_pem_slice(cert.certificate_pem.as_bytes()).map_err(|e| {
            Error::Tls(format!("Failed to parse certificate of '{}': {e}", cert.agent_id))
        })?;
        let ca = CertificateDer::from_pem_slice(cert.ca_certificate_pem.as_bytes())
            .map_err(|e| Error::Tls(format!("Failed to parse CA certificate: {e}")))?;
        let key = PrivateKeyDer::from_pem_slice(cert.private_key.expose().as_bytes()).map_err(|e| {
            Error::Tls(format!("Failed to parse private key of '{}': {e}", cert.agent_id))
        })?;

        let mut roots = RootCertStore::empty();
        roots
            .add(ca.clone())
            .map_err(|e| Error::Tls(format!("Failed to add CA cert to trust store: {e}")))?;

        debug!(agent_id = %cert.agent_id, serial = cert.serial_number, "Transport context built");

        Ok(TransportSecurityContext {
            agent_id: cert.agent_id.clone(),
            chain: vec![leaf, ca],
            key,
            roots: Arc::new(roots),
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
        })
    }
}

/// Agent key, chain and trust anchor ready for rustls.
pub struct TransportSecurityContext {
    agent_id: String,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl std::fmt::Debug for TransportSecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSecurityContext")
            .field("agent_id", &self.agent_id)
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

impl TransportSecurityContext {
    /// Agent the context belongs to.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Agent certificate followed by the CA certificate.
    #[must_use]
    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Server config that rejects clients without a certificate from the CA.
    ///
    /// # Errors
    ///
    /// Returns `Error::Tls` if rustls rejects the verifier or the key pair.
    pub fn server_config(&self) -> Result<ServerConfig> {
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::clone(&self.roots), Arc::clone(&self.provider))
                .build()
                .map_err(|e| Error::Tls(format!("Failed to build client verifier: {e}")))?;

        ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("Unsupported protocol versions: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| Error::Tls(format!("TLS config error (cert/key mismatch?): {e}")))
    }

    /// Client config that presents the agent certificate and trusts only the CA.
    ///
    /// # Errors
    ///
    /// Returns `Error::Tls` if rustls rejects the key pair.
    pub fn client_config(&self) -> Result<ClientConfig> {
        ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(format!("Unsupported protocol versions: {e}")))?
            .with_root_certificates(Arc::clone(&self.roots))
            .with_client_auth_cert(self.chain.clone(), self.key.clone_key())
            .map_err(|e| Error::Tls(format!("TLS config error (cert/key mismatch?): {e}")))
    }

    /// `tokio-rustls` acceptor over [`server_config`](Self::server_config).
    ///
    /// # Errors
    ///
    /// See [`server_config`](Self::server_config).
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.server_config()?)))
    }

    /// `tokio-rustls` connector over [`client_config`](Self::client_config).
    ///
    /// # Errors
    ///
    /// See [`client_config`](Self::client_config).
    pub fn connector(&self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(Arc::new(self.client_config()?)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use rustls::pki_types::ServerName;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::mtls::authority::CertificateAuthority;
    use crate::mtls::clock::SystemClock;
    use crate::mtls::config::MtlsConfig;
    use crate::mtls::issuance::IssuanceService;
    use crate::mtls::record::AgentInfo;
    use crate::mtls::storage::CertStorage;
    use crate::mtls::store::CertificateStore;

    // Handshakes check validity against the wall clock, so these tests issue
    // with the system clock.
    fn issuance(dir: &std::path::Path) -> IssuanceService {
        let config = MtlsConfig::with_cert_path(dir);
        let storage = CertStorage::open(dir).unwrap();
        let authority =
            Arc::new(CertificateAuthority::load_or_create(&config, storage.clone(), &SystemClock).unwrap());
        let store = Arc::new(CertificateStore::open(storage).unwrap());
        IssuanceService::new(&config, authority, store, Arc::new(SystemClock))
    }

    #[test]
    fn build_parses_chain_and_key() {
        // GIVEN: an issued certificate
        let dir = tempfile::tempdir().unwrap();
        let cert = issuance(dir.path()).issue("agent-1", &AgentInfo::default()).unwrap();
        // WHEN: building the context
        let ctx = TlsContextFactory::build(&cert).unwrap();
        // THEN: both configs build and the chain is leaf + CA
        assert_eq!(ctx.agent_id(), "agent-1");
        assert_eq!(ctx.certificate_chain().len(), 2);
        assert!(ctx.server_config().is_ok());
        assert!(ctx.client_config().is_ok());
    }

    #[test]
    fn debug_output_omits_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert = issuance(dir.path()).issue("agent-1", &AgentInfo::default()).unwrap();
        let ctx = TlsContextFactory::build(&cert).unwrap();
        let debug = format!("{ctx:?}");
        assert!(debug.contains("agent-1"));
        assert!(!debug.contains("PRIVATE"));
    }

    #[test]
    fn corrupt_key_is_tls_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cert = issuance(dir.path()).issue("agent-1", &AgentInfo::default()).unwrap();
        cert.private_key = crate::mtls::record::PrivateKeyPem::new("garbage".to_string());
        let err = TlsContextFactory::build(&cert).unwrap_err();
        assert_eq!(err.kind(), "tls");
    }

    #[tokio::test]
    async fn two_agents_complete_mutual_handshake() {
        // GIVEN: two agents from the same authority
        let dir = tempfile::tempdir().unwrap();
        let service = issuance(dir.path());
        let server = TlsContextFactory::build(&service.issue("agent-1", &AgentInfo::default()).unwrap()).unwrap();
        let client = TlsContextFactory::build(&service.issue("agent-2", &AgentInfo::default()).unwrap()).unwrap();

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let acceptor = server.acceptor().unwrap();
        let connector = client.connector().unwrap();
        let name = ServerName::try_from("agent-1.agents.local").unwrap();

        // WHEN: both sides handshake
        let (accepted, connected) =
            tokio::join!(acceptor.accept(server_io), connector.connect(name, client_io));
        let mut server_stream = accepted.unwrap();
        let mut client_stream = connected.unwrap();

        // THEN: the server sees the client's certificate and data flows
        let peer = server_stream.get_ref().1.peer_certificates().unwrap();
        assert_eq!(peer[0], client.certificate_chain()[0]);

        client_stream.write_all(b"ping").await.unwrap();
        client_stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        server_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn client_from_other_authority_is_refused() {
        // GIVEN: a server and a client whose CAs differ
        let server_dir = tempfile::tempdir().unwrap();
        let client_dir = tempfile::tempdir().unwrap();
        let server = TlsContextFactory::build(
            &issuance(server_dir.path()).issue("agent-1", &AgentInfo::default()).unwrap(),
        )
        .unwrap();
        let client = TlsContextFactory::build(
            &issuance(client_dir.path()).issue("agent-2", &AgentInfo::default()).unwrap(),
        )
        .unwrap();

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let acceptor = server.acceptor().unwrap();
        let connector = client.connector().unwrap();
        let name = ServerName::try_from("agent-1").unwrap();

        // WHEN: handshaking
        let (accepted, connected) =
            tokio::join!(acceptor.accept(server_io), connector.connect(name, client_io));

        // THEN: at least one side rejects the peer
        assert!(accepted.is_err() || connected.is_err());
    }
}

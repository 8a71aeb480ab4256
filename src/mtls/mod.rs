//! Mutual TLS certificate authority for agents.
//!
//! Every agent talking to the gateway holds a certificate issued by a single
//! self-signed root owned by the gateway. This module creates that root,
//! issues and revokes agent certificates, validates certificates presented
//! by agents and turns an issued certificate into rustls configuration.
//!
//! # Architecture
//!
//! ```text
//! CertificateManager (async facade, bounded spawn_blocking)
//!   ├─ IssuanceService   → KeyPairGenerator, CertificateAuthority, CertificateStore
//!   ├─ ValidationService → CertificateCodec, CertificateAuthority, CertificateStore
//!   └─ TlsContextFactory → rustls ServerConfig / ClientConfig
//! CertificateAuthority, CertificateStore → CertStorage (files under cert_path)
//! ```
//!
//! # Modules
//!
//! - [`config`] — YAML configuration (`MtlsConfig`)
//! - [`keys`] — key pair generation
//! - [`codec`] — PEM/X.509 encode, decode and signature checks
//! - [`authority`] — the root: bootstrap, serial counter, signing
//! - [`store`] — current certificate per agent plus the revocation ledger
//! - [`issuance`] / [`validation`] — the two services
//! - [`tls`] — rustls contexts
//! - [`manager`] — async facade over all of the above
//!
//! # Quick start
//!
//! ```yaml
//! mtls:
//!   cert_path: "~/.payments-gateway/certs"
//!   certificate_validity_days: 365
//!   san_domain: "agents.local"
//! ```

pub mod audit;
pub mod authority;
pub mod clock;
pub mod codec;
pub mod config;
pub mod issuance;
pub mod keys;
pub mod manager;
pub mod record;
pub mod storage;
pub mod store;
pub mod tls;
pub mod validation;

pub use authority::CertificateAuthority;
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{CertificateCodec, CertificateInfo, SubjectInfo};
pub use config::MtlsConfig;
pub use issuance::IssuanceService;
pub use keys::{KeyAlgorithm, KeyPair, KeyPairGenerator};
pub use manager::CertificateManager;
pub use record::{AgentCertificate, AgentInfo, CertificateStatus, StatusKind};
pub use storage::CertStorage;
pub use store::CertificateStore;
pub use tls::{TlsContextFactory, TransportSecurityContext};
pub use validation::{ValidationFailure, ValidationService};

//! Payments MCP Gateway Library
//!
//! Agent identity for the payments tool gateway: a private certificate
//! authority that issues, validates and revokes the X.509 certificates agents
//! use for mutual TLS.
//!
//! # Features
//!
//! - **Self-managed CA**: root created on first start, reloaded afterwards
//! - **Issuance**: per-agent certificates, reused until they expire
//! - **Validation**: chain, validity window, subject and revocation checks
//! - **Transport**: rustls server/client configs from an issued certificate

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod mtls;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).try_init(),
        _ => subscriber.with(fmt::layer().with_writer(std::io::stderr)).try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}

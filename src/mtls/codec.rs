//! Certificate encoding and decoding.
//!
//! Builds X.509 certificates from root/leaf templates (`rcgen`), and parses
//! PEM certificates back into [`CertificateInfo`] (`x509-parser`): subject,
//! issuer, validity window, serial number and the extensions the gateway
//! relies on. Signature verification against an issuer lives here too.
//!
//! # File format
//!
//! Certificates travel as PEM (`-----BEGIN CERTIFICATE-----`). Encoding
//! always uses LF line endings.

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose, SanType, SerialNumber,
};
use rcgen::string::Ia5String;
use serde::Serialize;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

const PEM_TAG: &str = "CERTIFICATE";

/// `emailAddress` attribute (PKCS #9).
const EMAIL_ADDRESS_OID: [u64; 7] = [1, 2, 840, 113_549, 1, 9, 1];

// ─────────────────────────────────────────────────────────────────────────────
// Decoded certificate
// ─────────────────────────────────────────────────────────────────────────────

/// Subject attributes the gateway reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubjectInfo {
    /// Common Name; the agent id for leaf certificates.
    pub common_name: String,
    /// Organisation (O).
    pub organization: Option<String>,
    /// Organisational Unit (OU).
    pub organizational_unit: Option<String>,
    /// PKCS #9 email address.
    pub email: Option<String>,
}

/// Key usage bits relevant to the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyUsageFlags {
    /// digitalSignature
    pub digital_signature: bool,
    /// keyEncipherment
    pub key_encipherment: bool,
    /// keyCertSign
    pub key_cert_sign: bool,
    /// cRLSign
    pub crl_sign: bool,
}

/// Extended key usage purposes relevant to mutual TLS.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtendedKeyUsageFlags {
    /// id-kp-serverAuth
    pub server_auth: bool,
    /// id-kp-clientAuth
    pub client_auth: bool,
}

/// A decoded certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    /// Serial number.
    pub serial_number: u64,
    /// Subject DN fields.
    pub subject: SubjectInfo,
    /// Issuer Common Name.
    pub issuer_common_name: String,
    /// Start of the validity window.
    pub not_before: DateTime<Utc>,
    /// End of the validity window.
    pub not_after: DateTime<Utc>,
    /// basicConstraints cA flag.
    pub is_ca: bool,
    /// basicConstraints pathLenConstraint.
    pub path_len_constraint: Option<u32>,
    /// keyUsage extension.
    pub key_usage: KeyUsageFlags,
    /// extendedKeyUsage extension.
    pub extended_key_usage: ExtendedKeyUsageFlags,
    /// DNS subject alternative names.
    pub san_dns: Vec<String>,
    /// Raw subjectPublicKey bits.
    #[serde(skip)]
    pub public_key: Vec<u8>,
    /// DER encoding of the whole certificate.
    #[serde(skip)]
    pub der: Vec<u8>,
}

impl CertificateInfo {
    /// Lower-case hex SHA-256 of the DER encoding.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(&self.der))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Templates (encoding side)
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters of the self-signed authority certificate.
#[derive(Debug)]
pub struct RootTemplate<'a> {
    /// Common Name of the authority (subject = issuer).
    pub common_name: &'a str,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
}

/// Parameters of an agent leaf certificate.
#[derive(Debug)]
pub struct LeafTemplate<'a> {
    /// Subject; `common_name` is the agent id.
    pub subject: &'a SubjectInfo,
    /// DNS SAN entries.
    pub san_dns: &'a [String],
    /// Serial number allocated by the authority.
    pub serial_number: u64,
    /// Start of validity.
    pub not_before: DateTime<Utc>,
    /// End of validity.
    pub not_after: DateTime<Utc>,
}

impl RootTemplate<'_> {
    /// `rcgen` parameters: CA with pathlen 0, keyCertSign + cRLSign.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateEncoding` if a timestamp is out of range.
    pub fn to_params(&self) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.common_name);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = to_offset(self.not_before)?;
        params.not_after = to_offset(self.not_after)?;
        // Agent serials count up from 1; the root takes its creation time.
        let root_serial = u64::try_from(self.not_before.timestamp()).unwrap_or(1).max(1);
        params.serial_number = Some(SerialNumber::from(root_serial));
        Ok(params)
    }
}

impl LeafTemplate<'_> {
    /// `rcgen` parameters: not-a-CA, digitalSignature + keyEncipherment,
    /// serverAuth + clientAuth, DNS SANs.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateEncoding` if a SAN or email is not valid
    /// IA5 text or a timestamp is out of range.
    pub fn to_params(&self) -> Result<CertificateParams> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.subject.common_name.as_str());
        if let Some(ref org) = self.subject.organization {
            dn.push(DnType::OrganizationName, org.as_str());
        }
        if let Some(ref ou) = self.subject.organizational_unit {
            dn.push(DnType::OrganizationalUnitName, ou.as_str());
        }
        let mut sans: Vec<SanType> = Vec::with_capacity(self.san_dns.len() + 1);
        if let Some(ref email) = self.subject.email {
            let ia5 = ia5(email)?;
            dn.push(
                DnType::CustomDnType(EMAIL_ADDRESS_OID.to_vec()),
                DnValue::Ia5String(ia5.clone()),
            );
            sans.push(SanType::Rfc822Name(ia5));
        }
        params.distinguished_name = dn;

        for dns in self.san_dns {
            sans.push(SanType::DnsName(ia5(dns)?));
        }
        params.subject_alt_names = sans;

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(SerialNumber::from(self.serial_number));
        params.not_before = to_offset(self.not_before)?;
        params.not_after = to_offset(self.not_after)?;
        Ok(params)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec
// ─────────────────────────────────────────────────────────────────────────────

/// PEM ⇄ [`CertificateInfo`] codec.
pub struct CertificateCodec;

impl CertificateCodec {
    /// Decode a PEM certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateEncoding` if the input is not a single
    /// well-formed `CERTIFICATE` PEM block.
    pub fn decode(pem_bytes: impl AsRef<[u8]>) -> Result<CertificateInfo> {
        let block = pem::parse(pem_bytes.as_ref())
            .map_err(|e| Error::CertificateEncoding(format!("Invalid PEM: {e}")))?;
        if block.tag() != PEM_TAG {
            return Err(Error::CertificateEncoding(format!(
                "Expected a {PEM_TAG} PEM block, found '{}'",
                block.tag()
            )));
        }
        Self::decode_der(block.contents())
    }

    /// Decode a DER certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateEncoding` if parsing fails, the subject has
    /// no Common Name, or the serial does not fit in 64 bits.
    pub fn decode_der(der: &[u8]) -> Result<CertificateInfo> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::CertificateEncoding(format!("Failed to parse certificate: {e}")))?;

        let subject = SubjectInfo {
            common_name: first_attr(cert.subject().iter_common_name()).ok_or_else(|| {
                Error::CertificateEncoding("Certificate subject has no Common Name".to_string())
            })?,
            organization: first_attr(cert.subject().iter_organization()),
            organizational_unit: first_attr(cert.subject().iter_organizational_unit()),
            email: first_attr(cert.subject().iter_email()),
        };
        let issuer_common_name = first_attr(cert.issuer().iter_common_name()).unwrap_or_default();

        let (is_ca, path_len_constraint) = match cert.basic_constraints() {
            Ok(Some(bc)) => (bc.value.ca, bc.value.path_len_constraint),
            Ok(None) => (false, None),
            Err(e) => {
                return Err(Error::CertificateEncoding(format!(
                    "Malformed basicConstraints: {e}"
                )));
            }
        };

        let key_usage = match cert.key_usage() {
            Ok(Some(ku)) => KeyUsageFlags {
                digital_signature: ku.value.digital_signature(),
                key_encipherment: ku.value.key_encipherment(),
                key_cert_sign: ku.value.key_cert_sign(),
                crl_sign: ku.value.crl_sign(),
            },
            Ok(None) => KeyUsageFlags::default(),
            Err(e) => {
                return Err(Error::CertificateEncoding(format!("Malformed keyUsage: {e}")));
            }
        };

        let extended_key_usage = match cert.extended_key_usage() {
            Ok(Some(eku)) => ExtendedKeyUsageFlags {
                server_auth: eku.value.server_auth,
                client_auth: eku.value.client_auth,
            },
            Ok(None) => ExtendedKeyUsageFlags::default(),
            Err(e) => {
                return Err(Error::CertificateEncoding(format!(
                    "Malformed extendedKeyUsage: {e}"
                )));
            }
        };

        let mut san_dns = Vec::new();
        if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
            for name in &san_ext.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    san_dns.push((*dns).to_owned());
                }
            }
        }

        Ok(CertificateInfo {
            serial_number: serial_to_u64(cert.raw_serial())?,
            subject,
            issuer_common_name,
            not_before: from_timestamp(cert.validity().not_before.timestamp())?,
            not_after: from_timestamp(cert.validity().not_after.timestamp())?,
            is_ca,
            path_len_constraint,
            key_usage,
            extended_key_usage,
            san_dns,
            public_key: cert.public_key().subject_public_key.data.to_vec(),
            der: der.to_vec(),
        })
    }

    /// Encode a decoded certificate back to PEM.
    #[must_use]
    pub fn encode(info: &CertificateInfo) -> String {
        Self::encode_der(&info.der)
    }

    /// Wrap DER bytes in a `CERTIFICATE` PEM block with LF line endings.
    #[must_use]
    pub fn encode_der(der: &[u8]) -> String {
        let block = pem::Pem::new(PEM_TAG, der.to_vec());
        pem::encode_config(
            &block,
            pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
        )
    }

    /// Verify that `cert` carries a valid signature by `issuer`'s key.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateEncoding` if either certificate cannot be
    /// re-parsed, or `Error::Signing` if the signature does not verify.
    pub fn verify_signature(cert: &CertificateInfo, issuer: &CertificateInfo) -> Result<()> {
        let (_, leaf) = X509Certificate::from_der(&cert.der)
            .map_err(|e| Error::CertificateEncoding(format!("Failed to parse certificate: {e}")))?;
        let (_, ca) = X509Certificate::from_der(&issuer.der)
            .map_err(|e| Error::CertificateEncoding(format!("Failed to parse issuer: {e}")))?;
        leaf.verify_signature(Some(ca.public_key()))
            .map_err(|e| Error::Signing(format!("Signature verification failed: {e}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn first_attr<'a, 'b: 'a, I>(mut attrs: I) -> Option<String>
where
    I: Iterator<Item = &'a x509_parser::x509::AttributeTypeAndValue<'b>>,
{
    attrs
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

fn ia5(value: &str) -> Result<Ia5String> {
    Ia5String::try_from(value)
        .map_err(|e| Error::CertificateEncoding(format!("'{value}' is not valid IA5 text: {e}")))
}

/// DER INTEGER content bytes → `u64`. Leading zero bytes (sign padding) are
/// ignored.
fn serial_to_u64(raw: &[u8]) -> Result<u64> {
    let significant: Vec<u8> = raw.iter().copied().skip_while(|b| *b == 0).collect();
    if significant.len() > 8 {
        return Err(Error::CertificateEncoding(format!(
            "Serial number {} does not fit in 64 bits",
            hex::encode(raw)
        )));
    }
    Ok(significant
        .iter()
        .fold(0_u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn to_offset(at: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::CertificateEncoding(format!("Timestamp out of range: {e}")))
}

fn from_timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::CertificateEncoding(format!("Timestamp {secs} out of range")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

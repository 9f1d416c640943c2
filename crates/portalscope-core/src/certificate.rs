//! PEM certificate decoding.
//!
//! Converts the PEM string handed out by the decryption addon into a
//! [`ParsedCertificate`]. Decoding is all-or-nothing: a truncated armor, a
//! bad base64 body or an undecodable DER structure is an error, never a
//! partially filled certificate.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// PEM tags accepted as certificates.
const CERTIFICATE_TAGS: &[&str] = &["CERTIFICATE", "TRUSTED CERTIFICATE", "X509 CERTIFICATE"];

/// Certificate decoding errors.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Input is not PEM armored or the armor is incomplete.
    #[error("invalid PEM: {0}")]
    Pem(String),

    /// PEM block is not a certificate.
    #[error("unexpected PEM tag: {0}")]
    UnexpectedTag(String),

    /// DER payload is not a valid X.509 certificate.
    #[error("invalid certificate: {0}")]
    Der(String),

    /// DER payload has bytes after the certificate.
    #[error("invalid certificate: {0} trailing bytes")]
    TrailingData(usize),
}

/// Result type for certificate operations.
pub type Result<T> = std::result::Result<T, CertificateError>;

/// A decoded CA certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    subject: String,
    issuer: String,
    serial: String,
    der: Vec<u8>,
    pem: String,
    alias: Option<String>,
}

impl ParsedCertificate {
    /// Decodes a PEM armored certificate.
    pub fn from_pem(pem_text: &str) -> Result<Self> {
        let block = pem::parse(pem_text).map_err(|e| CertificateError::Pem(e.to_string()))?;

        if !CERTIFICATE_TAGS.contains(&block.tag()) {
            return Err(CertificateError::UnexpectedTag(block.tag().to_string()));
        }

        let mut cert = Self::from_der(block.contents().to_vec())?;
        cert.pem = pem_text.to_string();
        Ok(cert)
    }

    /// Decodes a DER certificate. The PEM form is regenerated from the DER.
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let (subject, issuer, serial) = {
            let (rest, cert) = x509_parser::parse_x509_certificate(&der)
                .map_err(|e| CertificateError::Der(e.to_string()))?;
            if !rest.is_empty() {
                return Err(CertificateError::TrailingData(rest.len()));
            }
            (
                cert.subject().to_string(),
                cert.issuer().to_string(),
                cert.tbs_certificate.raw_serial_as_string(),
            )
        };

        let pem = pem::encode(&pem::Pem::new("CERTIFICATE", der.clone()));

        Ok(Self {
            subject,
            issuer,
            serial,
            der,
            pem,
            alias: None,
        })
    }

    /// Decodes trust-store file contents, which may be PEM (optionally with
    /// a human-readable preamble) or raw DER.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let looks_like_pem = bytes.windows(11).any(|w| w == b"-----BEGIN ");
        if looks_like_pem {
            let text = std::str::from_utf8(bytes).map_err(|e| CertificateError::Pem(e.to_string()))?;
            Self::from_pem(text)
        } else {
            Self::from_der(bytes.to_vec())
        }
    }

    /// Returns the subject distinguished name.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Returns the issuer distinguished name.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Returns the serial number as colon separated hex.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Returns the raw DER bytes.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Returns the PEM text.
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Returns the trust-store alias recorded by the last membership check.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Records the trust-store alias found by a membership check.
    pub fn set_alias(&mut self, alias: Option<String>) {
        self.alias = alias;
    }

    /// Returns true if `der` is byte-identical to this certificate.
    pub fn same_identity(&self, der: &[u8]) -> bool {
        self.der == der
    }

    /// Returns the SHA-256 fingerprint as uppercase colon separated hex.
    pub fn fingerprint_sha256(&self) -> String {
        let digest = Sha256::digest(&self.der);
        digest
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }
}

//! Agent-side certificate handling.
//!
//! The agent generates its key pair locally (the private key never leaves
//! the agent), submits a CSR, and inspects the certificates it gets back.

use chrono::{DateTime, TimeZone, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use thiserror::Error;
use x509_parser::pem::parse_x509_pem;

use hubjoin_core::AgentIdentity;

/// Errors that can occur during certificate operations.
#[derive(Debug, Error)]
pub enum PkiError {
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(String),

    #[error("failed to create CSR: {0}")]
    CsrGeneration(String),

    #[error("failed to parse certificate: {0}")]
    ParseCert(String),
}

/// A freshly generated key pair and the CSR for it.
pub struct AgentCertRequest {
    key_pem: String,
    csr_pem: String,
}

impl AgentCertRequest {
    /// Generate a new key pair and CSR asserting `identity`.
    pub fn generate(identity: &AgentIdentity) -> Result<Self, PkiError> {
        let key_pair = KeyPair::generate().map_err(|e| PkiError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, identity.common_name());
        dn.push(DnType::OrganizationName, identity.cluster_name.clone());
        params.distinguished_name = dn;

        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| PkiError::CsrGeneration(e.to_string()))?;
        let csr_pem = csr
            .pem()
            .map_err(|e| PkiError::CsrGeneration(e.to_string()))?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            csr_pem,
        })
    }

    /// The CSR in PEM format (sent to the hub).
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// The private key in PEM format (stored locally).
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}

/// Fields of interest from an X.509 certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    pub common_name: Option<String>,
    pub subject: String,
    pub issuer: String,
    pub not_after: DateTime<Utc>,
}

/// Parse the first certificate of a PEM document.
pub fn inspect(cert_pem: &str) -> Result<CertInfo, PkiError> {
    let (_, pem) =
        parse_x509_pem(cert_pem.as_bytes()).map_err(|e| PkiError::ParseCert(e.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| PkiError::ParseCert(e.to_string()))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);

    let not_after = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| PkiError::ParseCert("notAfter out of range".to_string()))?;

    Ok(CertInfo {
        common_name,
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_after,
    })
}

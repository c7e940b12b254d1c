//! Certificate Authority for signing agent CSRs.
//!
//! Uses x509-parser to read the CSR subject and rcgen to issue certificates
//! for the CSR's own public key.

use std::path::Path;

use chrono::{DateTime, Datelike, Duration, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;
use x509_parser::prelude::*;

use hubjoin_core::ids::COMMON_NAME_PREFIX;
use hubjoin_core::AgentIdentity;

/// Errors that can occur during CA operations.
#[derive(Debug, Error)]
pub enum CaError {
    #[error("CA certificate and key paths must be set together")]
    IncompletePaths,

    #[error("failed to read CA certificate: {0}")]
    ReadCert(std::io::Error),

    #[error("failed to read CA private key: {0}")]
    ReadKey(std::io::Error),

    #[error("failed to parse CA certificate: {0}")]
    ParseCert(String),

    #[error("failed to parse CA private key: {0}")]
    ParseKey(String),

    #[error("failed to parse CSR: {0}")]
    ParseCsr(String),

    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    #[error("failed to sign certificate: {0}")]
    SignError(String),
}

/// Certificate Authority that signs agent certificates.
pub struct CertificateAuthority {
    /// CA certificate (PEM), as distributed to agents.
    ca_cert_pem: String,

    /// Issuer certificate used for signing.
    ca_cert: Certificate,

    ca_key_pair: KeyPair,

    /// Issued certificate validity in days.
    validity_days: u32,
}

impl CertificateAuthority {
    /// Generate a fresh self-signed CA held in memory.
    pub fn generate(common_name: &str, validity_days: u32) -> Result<Self, CaError> {
        let ca_key_pair = KeyPair::generate().map_err(|e| CaError::SignError(e.to_string()))?;

        let ca_cert = ca_params(common_name)
            .self_signed(&ca_key_pair)
            .map_err(|e| CaError::SignError(e.to_string()))?;

        Ok(Self {
            ca_cert_pem: ca_cert.pem(),
            ca_cert,
            ca_key_pair,
            validity_days: validity_days.max(1),
        })
    }

    /// Load CA from certificate and key files.
    pub fn from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        validity_days: u32,
    ) -> Result<Self, CaError> {
        let ca_cert_pem = std::fs::read_to_string(cert_path).map_err(CaError::ReadCert)?;
        let ca_key_pem = std::fs::read_to_string(key_path).map_err(CaError::ReadKey)?;
        Self::from_pem(ca_cert_pem, &ca_key_pem, validity_days)
    }

    /// Load CA from PEM strings.
    pub fn from_pem(
        ca_cert_pem: String,
        ca_key_pem: &str,
        validity_days: u32,
    ) -> Result<Self, CaError> {
        let ca_key_pair =
            KeyPair::from_pem(ca_key_pem).map_err(|e| CaError::ParseKey(e.to_string()))?;

        // Rebuild the issuer from the stored certificate so issued
        // certificates carry its exact subject.
        let ca_cert = CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .map_err(|e| CaError::ParseCert(e.to_string()))?
            .self_signed(&ca_key_pair)
            .map_err(|e| CaError::ParseCert(e.to_string()))?;

        Ok(Self {
            ca_cert_pem,
            ca_cert,
            ca_key_pair,
            validity_days: validity_days.max(1),
        })
    }

    /// Get the CA certificate in PEM format.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Get the CA private key in PEM format.
    pub fn ca_key_pem(&self) -> String {
        self.ca_key_pair.serialize_pem()
    }

    /// Check a CSR without signing it.
    ///
    /// The subject CN must be `hubjoin:<cluster>:<agent>`.
    pub fn inspect_csr(&self, csr_pem: &str) -> Result<AgentIdentity, CaError> {
        let pem = ::pem::parse(csr_pem).map_err(|e| CaError::ParseCsr(e.to_string()))?;

        let (_, csr) = X509CertificationRequest::from_der(pem.contents())
            .map_err(|e| CaError::ParseCsr(e.to_string()))?;

        let subject_cn = csr
            .certification_request_info
            .subject
            .iter_common_name()
            .next()
            .ok_or_else(|| {
                CaError::InvalidCsr("CSR does not contain a Common Name (CN)".to_string())
            })?
            .as_str()
            .map_err(|e| CaError::InvalidCsr(format!("failed to parse CN: {}", e)))?
            .to_string();

        AgentIdentity::from_common_name(&subject_cn).ok_or_else(|| {
            CaError::InvalidCsr(format!(
                "CN must look like '{}:<cluster>:<agent>', got '{}'",
                COMMON_NAME_PREFIX, subject_cn
            ))
        })
    }

    /// Sign a Certificate Signing Request (CSR).
    ///
    /// The certificate is issued for the CSR's own public key; the agent's
    /// private key never reaches the hub.
    pub fn sign_csr(&self, csr_pem: &str) -> Result<SignedCertificate, CaError> {
        let identity = self.inspect_csr(csr_pem)?;

        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| CaError::ParseCsr(e.to_string()))?;

        let not_before = Utc::now();
        let not_after = not_before + Duration::days(i64::from(self.validity_days));
        let expires_at = not_after
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc())
            .ok_or_else(|| CaError::SignError("invalid expiry date".to_string()))?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, identity.common_name());
        dn.push(DnType::OrganizationName, identity.cluster_name.clone());

        let params = &mut csr_params.params;
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.not_before = rcgen::date_time_ymd(
            not_before.year(),
            not_before.month() as u8,
            not_before.day() as u8,
        );
        params.not_after = rcgen::date_time_ymd(
            not_after.year(),
            not_after.month() as u8,
            not_after.day() as u8,
        );
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let cert = csr_params
            .signed_by(&self.ca_cert, &self.ca_key_pair)
            .map_err(|e| CaError::SignError(e.to_string()))?;

        Ok(SignedCertificate {
            cert_pem: cert.pem(),
            expires_at,
            identity,
        })
    }
}

fn ca_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "hubjoin");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

/// A signed certificate returned by the CA.
#[derive(Debug, Clone)]
pub struct SignedCertificate {
    /// The signed certificate in PEM format.
    pub cert_pem: String,

    /// When the certificate expires.
    pub expires_at: DateTime<Utc>,

    /// Identity taken from the CSR.
    pub identity: AgentIdentity,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn csr(cn: &str) -> (String, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let csr = params.serialize_request(&key).unwrap();
        (csr.pem().unwrap(), key)
    }

    #[test]
    fn test_signs_csr_public_key() {
        let ca = CertificateAuthority::generate("Test Hub CA", 30).unwrap();
        let (csr_pem, key) = csr("hubjoin:cluster1:agent");

        let signed = ca.sign_csr(&csr_pem).unwrap();
        assert_eq!(signed.identity, AgentIdentity::new("cluster1", "agent"));
        assert!(signed.expires_at > Utc::now() + Duration::days(28));

        let (_, pem) = x509_parser::pem::parse_x509_pem(signed.cert_pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        assert_eq!(
            cert.public_key().raw,
            key.public_key_der().as_slice(),
            "certificate must carry the CSR's key"
        );

        let (_, ca_pem) = x509_parser::pem::parse_x509_pem(ca.ca_cert_pem().as_bytes()).unwrap();
        let ca_cert = ca_pem.parse_x509().unwrap();
        assert_eq!(cert.issuer().to_string(), ca_cert.subject().to_string());
    }

    #[test]
    fn test_rejects_foreign_common_name() {
        let ca = CertificateAuthority::generate("Test Hub CA", 30).unwrap();
        let (csr_pem, _) = csr("worker:abc");
        assert!(matches!(ca.sign_csr(&csr_pem), Err(CaError::InvalidCsr(_))));
    }

    #[test]
    fn test_rejects_garbage() {
        let ca = CertificateAuthority::generate("Test Hub CA", 30).unwrap();
        assert!(matches!(ca.sign_csr("nope"), Err(CaError::ParseCsr(_))));
    }

    #[test]
    fn test_reload_from_pem_keeps_subject() {
        let ca = CertificateAuthority::generate("Test Hub CA", 30).unwrap();
        let reloaded =
            CertificateAuthority::from_pem(ca.ca_cert_pem().to_string(), &ca.ca_key_pem(), 30)
                .unwrap();

        let (csr_pem, _) = csr("hubjoin:c:a");
        let signed = reloaded.sign_csr(&csr_pem).unwrap();

        let (_, pem) = x509_parser::pem::parse_x509_pem(signed.cert_pem.as_bytes()).unwrap();
        let issuer = pem.parse_x509().unwrap().issuer().to_string();
        let (_, ca_pem) = x509_parser::pem::parse_x509_pem(ca.ca_cert_pem().as_bytes()).unwrap();
        assert_eq!(issuer, ca_pem.parse_x509().unwrap().subject().to_string());
    }
}

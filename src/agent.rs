//! Agent credential bootstrap: the DER certificate and RSA private key
//! this endpoint presents over QUIC, and the fingerprint it advertises in
//! the `pk` TXT field.

use crate::cert::parsed::{DigestAlgorithm, X509Cert};
use crate::crypto::sha256_fingerprint;
use crate::errors::{Error, Result};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::path::Path;

/// The loaded agent credentials. Process-wide state, initialised once
/// after logging is configured and injected where needed.
pub struct AgentCertificate {
    certificate_der: Vec<u8>,
    certificate: X509Cert,
    private_key: RsaPrivateKey,
    fingerprint: String,
}

impl AgentCertificate {
    /// Loads a DER-encoded certificate and RSA private key (PKCS#1 or
    /// PKCS#8 DER) from the embedder-supplied paths.
    pub fn load(certificate_path: &Path, key_path: &Path) -> Result<AgentCertificate> {
        let certificate_der = std::fs::read(certificate_path).map_err(|e| {
            Error::CredentialLoad(format!(
                "failed to read certificate {}: {}",
                certificate_path.display(),
                e
            ))
        })?;
        let certificate = X509Cert::from_der(&certificate_der)
            .map_err(|_| Error::CredentialLoad("unparsable agent certificate".to_string()))?;

        let key_der = std::fs::read(key_path).map_err(|e| {
            Error::CredentialLoad(format!(
                "failed to read private key {}: {}",
                key_path.display(),
                e
            ))
        })?;
        let private_key = RsaPrivateKey::from_pkcs1_der(&key_der)
            .or_else(|_| RsaPrivateKey::from_pkcs8_der(&key_der))
            .map_err(|_| Error::CredentialLoad("unparsable agent private key".to_string()))?;

        let fingerprint = sha256_fingerprint(&certificate_der);

        Ok(AgentCertificate {
            certificate_der,
            certificate,
            private_key,
            fingerprint,
        })
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn certificate(&self) -> &X509Cert {
        &self.certificate
    }

    /// The colon-separated SHA-256 fingerprint advertised under `pk`.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Signs `data` with the agent key, RSASSA PKCS#1 v1.5.
    pub fn sign(&self, algorithm: DigestAlgorithm, data: &[u8]) -> Result<Vec<u8>> {
        let result = match algorithm {
            DigestAlgorithm::Sha1 => self
                .private_key
                .sign(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(data)),
            DigestAlgorithm::Sha256 => self
                .private_key
                .sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data)),
            DigestAlgorithm::Sha384 => self
                .private_key
                .sign(Pkcs1v15Sign::new::<Sha384>(), &Sha384::digest(data)),
            DigestAlgorithm::Sha512 => self
                .private_key
                .sign(Pkcs1v15Sign::new::<Sha512>(), &Sha512::digest(data)),
        };
        result.map_err(|e| Error::Authentication(format!("signing failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_credential_errors() {
        let result = AgentCertificate::load(
            Path::new("/nonexistent/agent.der"),
            Path::new("/nonexistent/agent.key"),
        );
        assert!(matches!(result, Err(Error::CredentialLoad(_))));
    }
}

//! The parsed-certificate capability surface and its X.509 backend.
//!
//! The validator operates on the [`ParsedCertificate`] trait so chain
//! logic is testable with synthetic certificates; [`X509Cert`] is the
//! production implementation over DER input.

use crate::cert::time::GeneralizedTime;
use crate::errors::{Error, Result};
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Digests supported for RSASSA PKCS#1 v1.5 signatures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyUsage {
    pub digital_signature: bool,
    pub key_cert_sign: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BasicConstraints {
    pub ca: bool,
    pub path_len: Option<u32>,
}

/// What the validator needs from a certificate.
pub trait ParsedCertificate: Send + Sync {
    /// The DER encoding, preceded by `front_padding` zero bytes.
    fn serialize_to_der(&self, front_padding: usize) -> Vec<u8>;

    fn not_before(&self) -> GeneralizedTime;
    fn not_after(&self) -> GeneralizedTime;

    fn common_name(&self) -> &str;

    /// The subjectPublicKeyInfo TLV.
    fn spki_tlv(&self) -> &[u8];

    /// The serial number, where it fits in 64 bits.
    fn serial_number(&self) -> Result<u64>;

    fn subject_raw(&self) -> &[u8];
    fn issuer_raw(&self) -> &[u8];

    fn key_usage(&self) -> Option<KeyUsage>;
    fn basic_constraints(&self) -> Option<BasicConstraints>;

    /// Whether the DER-encoded policy OID appears in this certificate's
    /// certificatePolicies extension.
    fn has_policy_oid(&self, oid: &[u8]) -> bool;

    /// Bit length of the subject public key.
    fn public_key_bits(&self) -> usize;

    /// The digest named by the signature algorithm, if supported.
    fn signature_digest(&self) -> Option<DigestAlgorithm>;

    /// Whether the outer signature algorithm matches the one inside the
    /// TBS certificate.
    fn signature_algorithms_match(&self) -> bool;

    /// The raw DER of the TBS certificate.
    fn tbs_der(&self) -> &[u8];

    /// The signature bytes over the TBS certificate.
    fn signature(&self) -> &[u8];

    /// Verifies an RSASSA PKCS#1 v1.5 signature made by this
    /// certificate's subject key.
    fn verify_signed_data(&self, algorithm: DigestAlgorithm, data: &[u8], signature: &[u8])
        -> bool;
}

/// A certificate parsed from DER, with every field the validator touches
/// extracted eagerly so the backing buffer is plain owned data.
pub struct X509Cert {
    der: Vec<u8>,
    tbs: Vec<u8>,
    signature: Vec<u8>,
    signature_digest: Option<DigestAlgorithm>,
    signature_algorithms_match: bool,
    subject: Vec<u8>,
    issuer: Vec<u8>,
    common_name: String,
    spki: Vec<u8>,
    serial: Option<u64>,
    not_before: GeneralizedTime,
    not_after: GeneralizedTime,
    public_key: Option<RsaPublicKey>,
    key_usage: Option<KeyUsage>,
    basic_constraints: Option<BasicConstraints>,
    policy_oids: Vec<Vec<u8>>,
}

fn digest_for_oid(oid: &str) -> Option<DigestAlgorithm> {
    match oid {
        "1.2.840.113549.1.1.5" => Some(DigestAlgorithm::Sha1),
        "1.2.840.113549.1.1.11" => Some(DigestAlgorithm::Sha256),
        "1.2.840.113549.1.1.12" => Some(DigestAlgorithm::Sha384),
        "1.2.840.113549.1.1.13" => Some(DigestAlgorithm::Sha512),
        _ => None,
    }
}

fn to_generalized_time(time: &x509_parser::time::ASN1Time) -> GeneralizedTime {
    let dt = time.to_datetime();
    GeneralizedTime {
        year: dt.year().clamp(0, u16::MAX as i32) as u16,
        month: u8::from(dt.month()),
        day: dt.day(),
        hour: dt.hour(),
        minute: dt.minute(),
        second: dt.second(),
    }
}

impl X509Cert {
    pub fn from_der(bytes: &[u8]) -> Result<X509Cert> {
        use x509_parser::extensions::ParsedExtension;
        use x509_parser::prelude::{FromDer, X509Certificate};

        let (rest, cert) =
            X509Certificate::from_der(bytes).map_err(|_| Error::CertsParse)?;
        if !rest.is_empty() {
            return Err(Error::CertsParse);
        }

        let mut key_usage = None;
        let mut basic_constraints = None;
        let mut policy_oids = Vec::new();
        for extension in cert.extensions() {
            match extension.parsed_extension() {
                ParsedExtension::KeyUsage(ku) => {
                    key_usage = Some(KeyUsage {
                        digital_signature: ku.digital_signature(),
                        key_cert_sign: ku.key_cert_sign(),
                    });
                }
                ParsedExtension::BasicConstraints(bc) => {
                    basic_constraints = Some(BasicConstraints {
                        ca: bc.ca,
                        path_len: bc.path_len_constraint,
                    });
                }
                ParsedExtension::CertificatePolicies(policies) => {
                    for policy in policies.iter() {
                        policy_oids.push(policy.policy_id.as_bytes().to_vec());
                    }
                }
                _ => {}
            }
        }

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();

        // The serial is reported only where it fits in 64 bits.
        let raw_serial: Vec<u8> = cert
            .tbs_certificate
            .raw_serial()
            .iter()
            .copied()
            .skip_while(|&b| b == 0)
            .collect();
        let serial = if raw_serial.len() <= 8 {
            let mut value: u64 = 0;
            for b in &raw_serial {
                value = value << 8 | *b as u64;
            }
            Some(value)
        } else {
            None
        };

        let signature_oid = cert.signature_algorithm.algorithm.to_id_string();
        let tbs_signature_oid = cert.tbs_certificate.signature.algorithm.to_id_string();

        let public_key = RsaPublicKey::from_public_key_der(cert.public_key().raw).ok();

        Ok(X509Cert {
            der: bytes.to_vec(),
            tbs: cert.tbs_certificate.as_ref().to_vec(),
            signature: cert.signature_value.data.as_ref().to_vec(),
            signature_digest: digest_for_oid(&signature_oid),
            signature_algorithms_match: signature_oid == tbs_signature_oid,
            subject: cert.subject().as_raw().to_vec(),
            issuer: cert.issuer().as_raw().to_vec(),
            common_name,
            spki: cert.public_key().raw.to_vec(),
            serial,
            not_before: to_generalized_time(&cert.validity().not_before),
            not_after: to_generalized_time(&cert.validity().not_after),
            public_key,
            key_usage,
            basic_constraints,
            policy_oids,
        })
    }
}

impl ParsedCertificate for X509Cert {
    fn serialize_to_der(&self, front_padding: usize) -> Vec<u8> {
        let mut out = vec![0u8; front_padding];
        out.extend_from_slice(&self.der);
        out
    }

    fn not_before(&self) -> GeneralizedTime {
        self.not_before
    }

    fn not_after(&self) -> GeneralizedTime {
        self.not_after
    }

    fn common_name(&self) -> &str {
        &self.common_name
    }

    fn spki_tlv(&self) -> &[u8] {
        &self.spki
    }

    fn serial_number(&self) -> Result<u64> {
        self.serial
            .ok_or_else(|| Error::ParameterInvalid("serial number exceeds 64 bits".to_string()))
    }

    fn subject_raw(&self) -> &[u8] {
        &self.subject
    }

    fn issuer_raw(&self) -> &[u8] {
        &self.issuer
    }

    fn key_usage(&self) -> Option<KeyUsage> {
        self.key_usage
    }

    fn basic_constraints(&self) -> Option<BasicConstraints> {
        self.basic_constraints
    }

    fn has_policy_oid(&self, oid: &[u8]) -> bool {
        self.policy_oids.iter().any(|p| p == oid)
    }

    fn public_key_bits(&self) -> usize {
        self.public_key
            .as_ref()
            .map(|key| key.size() * 8)
            .unwrap_or(0)
    }

    fn signature_digest(&self) -> Option<DigestAlgorithm> {
        self.signature_digest
    }

    fn signature_algorithms_match(&self) -> bool {
        self.signature_algorithms_match
    }

    fn tbs_der(&self) -> &[u8] {
        &self.tbs
    }

    fn signature(&self) -> &[u8] {
        &self.signature
    }

    fn verify_signed_data(
        &self,
        algorithm: DigestAlgorithm,
        data: &[u8],
        signature: &[u8],
    ) -> bool {
        let Some(key) = self.public_key.as_ref() else {
            return false;
        };
        let result = match algorithm {
            DigestAlgorithm::Sha1 => key.verify(
                Pkcs1v15Sign::new::<Sha1>(),
                &Sha1::digest(data),
                signature,
            ),
            DigestAlgorithm::Sha256 => key.verify(
                Pkcs1v15Sign::new::<Sha256>(),
                &Sha256::digest(data),
                signature,
            ),
            DigestAlgorithm::Sha384 => key.verify(
                Pkcs1v15Sign::new::<Sha384>(),
                &Sha384::digest(data),
                signature,
            ),
            DigestAlgorithm::Sha512 => key.verify(
                Pkcs1v15Sign::new::<Sha512>(),
                &Sha512::digest(data),
                signature,
            ),
        };
        result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_oids() {
        assert_eq!(
            digest_for_oid("1.2.840.113549.1.1.11"),
            Some(DigestAlgorithm::Sha256)
        );
        assert_eq!(digest_for_oid("1.2.840.113549.1.1.1"), None);
    }

    #[test]
    fn garbage_der_rejected() {
        assert!(matches!(
            X509Cert::from_der(&[0x30, 0x03, 0x01, 0x01, 0x00]),
            Err(Error::CertsParse)
        ));
        assert!(matches!(X509Cert::from_der(&[]), Err(Error::CertsParse)));
    }
}

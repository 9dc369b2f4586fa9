//! Certificate chain building and verification.
//!
//! A chain is built from the target certificate through the supplied
//! intermediates to a root in the trust store, backtracking across
//! alternatives. Verification enforces RSA moduli of at least 2048 bits,
//! the digital-signature key usage on the target, CA constraints on the
//! root, the root's path-length constraint, and the validity window of
//! every certificate in the chain.

use crate::cert::parsed::{DigestAlgorithm, ParsedCertificate};
use crate::cert::time::GeneralizedTime;
use crate::errors::{Error, Result};
use std::sync::Arc;

/// The audio-only device policy OID, 1.3.6.1.4.1.11129.2.5.2, in DER
/// content-octet form.
pub const AUDIO_ONLY_POLICY_OID: [u8; 10] =
    [0x2B, 0x06, 0x01, 0x04, 0x01, 0xD6, 0x79, 0x02, 0x05, 0x02];

const MIN_RSA_MODULUS_BITS: usize = 2048;

/// Whether a verified chain restricts the device to audio-only output.
/// The policy may appear on any certificate in the chain; absence means
/// unrestricted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DevicePolicy {
    Unrestricted,
    AudioOnly,
}

pub type CertHandle = Arc<dyn ParsedCertificate>;

/// The process-wide immutable set of trusted roots. Initialised once and
/// injected into verification calls.
pub struct TrustStore {
    roots: Vec<CertHandle>,
}

impl TrustStore {
    pub fn new(roots: Vec<CertHandle>) -> TrustStore {
        TrustStore { roots }
    }

    /// Builds a store from DER-encoded root certificates.
    pub fn from_der_certs(certs: &[&[u8]]) -> Result<TrustStore> {
        let mut roots: Vec<CertHandle> = Vec::with_capacity(certs.len());
        for der in certs {
            let cert = crate::cert::parsed::X509Cert::from_der(der)
                .map_err(|_| Error::CredentialLoad("unparsable trust anchor".to_string()))?;
            roots.push(Arc::new(cert));
        }
        Ok(TrustStore { roots })
    }

    pub fn roots(&self) -> &[CertHandle] {
        &self.roots
    }
}

/// A verified chain, target first, root last.
pub struct CertificatePath {
    pub path: Vec<CertHandle>,
    pub policy: DevicePolicy,
}

/// Exposes the verified target certificate for follow-on signature
/// checks.
pub struct VerificationContext {
    cert: CertHandle,
}

impl VerificationContext {
    pub fn common_name(&self) -> &str {
        self.cert.common_name()
    }

    pub fn verify_signature_over_data(
        &self,
        signature: &[u8],
        data: &[u8],
        algorithm: DigestAlgorithm,
    ) -> bool {
        self.cert.verify_signed_data(algorithm, data, signature)
    }
}

/// The target must be usable for signing and carry a common name.
fn check_target_restrictions(target: &dyn ParsedCertificate) -> Result<()> {
    let key_usage = target.key_usage().ok_or(Error::CertsRestrictions)?;
    if !key_usage.digital_signature {
        return Err(Error::CertsRestrictions);
    }
    if target.common_name().is_empty() {
        return Err(Error::CertsRestrictions);
    }
    Ok(())
}

fn verify_cert_time(cert: &dyn ParsedCertificate, time: &GeneralizedTime) -> Result<()> {
    if *time < cert.not_before() || cert.not_after() < *time {
        return Err(Error::CertsDateInvalid);
    }
    Ok(())
}

/// Verifies one candidate chain ordered target-first with the trusted
/// root last.
fn verify_chain(path: &[CertHandle], time: &GeneralizedTime) -> Result<()> {
    let root = path.last().expect("chain never empty");

    // The root must be a CA certificate whose key may sign certificates.
    let constraints = root.basic_constraints().ok_or(Error::CertsVerifyGeneric)?;
    if !constraints.ca {
        return Err(Error::CertsVerifyGeneric);
    }
    if let Some(key_usage) = root.key_usage() {
        if !key_usage.key_cert_sign {
            return Err(Error::CertsVerifyGeneric);
        }
    }
    if let Some(path_len) = constraints.path_len {
        if path.len() > path_len as usize + 2 {
            return Err(Error::CertsPathlen);
        }
    }

    // Walk issuer/subject pairs from the root towards the target.
    for window in path.windows(2).rev() {
        let subject = &window[0];
        let issuer = &window[1];

        // The target's time was validated up front; intermediates are
        // validated here. The root's window is not checked, matching the
        // trust-anchor treatment of the reference validator.
        if !Arc::ptr_eq(issuer, root) {
            verify_cert_time(issuer.as_ref(), time)?;
        }
        if !issuer.signature_algorithms_match() {
            return Err(Error::CertsVerifyGeneric);
        }
        if issuer.public_key_bits() < MIN_RSA_MODULUS_BITS {
            return Err(Error::CertsVerifyGeneric);
        }

        let digest = subject.signature_digest().ok_or(Error::CertsVerifyGeneric)?;
        if !issuer.verify_signed_data(digest, subject.tbs_der(), subject.signature()) {
            return Err(Error::CertsVerifyGeneric);
        }
    }

    Ok(())
}

fn in_path(path: &[CertHandle], cert: &CertHandle) -> bool {
    path.iter().any(|c| Arc::ptr_eq(c, cert))
}

/// Depth-first search for a chain ending at a trust anchor. Trust-store
/// candidates are tried before intermediates at every step, and a failed
/// candidate chain backtracks rather than failing the whole search.
fn search(
    path: &mut Vec<CertHandle>,
    intermediates: &[CertHandle],
    trust_store: &TrustStore,
    time: &GeneralizedTime,
    last_error: &mut Option<Error>,
) -> bool {
    let issuer_name = path.last().unwrap().issuer_raw().to_vec();

    for root in trust_store.roots() {
        if root.subject_raw() != issuer_name.as_slice() || in_path(path, root) {
            continue;
        }
        path.push(root.clone());
        match verify_chain(path, time) {
            Ok(()) => return true,
            Err(e) => {
                *last_error = Some(e);
                path.pop();
            }
        }
    }

    for intermediate in intermediates {
        if intermediate.subject_raw() != issuer_name.as_slice() || in_path(path, intermediate) {
            continue;
        }
        path.push(intermediate.clone());
        if search(path, intermediates, trust_store, time, last_error) {
            return true;
        }
        path.pop();
    }

    false
}

/// Builds and verifies a chain from `chain[0]` (the target) through the
/// remaining intermediates to a root in `trust_store`, evaluated at
/// `time`. On success the path is returned target-first together with its
/// device policy.
pub fn find_certificate_path(
    chain: &[CertHandle],
    time: &GeneralizedTime,
    trust_store: &TrustStore,
) -> Result<CertificatePath> {
    let Some(target) = chain.first() else {
        return Err(Error::CertsMissing);
    };
    let intermediates = &chain[1..];

    verify_cert_time(target.as_ref(), time)?;
    if target.public_key_bits() < MIN_RSA_MODULUS_BITS {
        return Err(Error::CertsVerifyGeneric);
    }
    if !target.signature_algorithms_match() {
        return Err(Error::CertsVerifyGeneric);
    }

    let mut path = vec![target.clone()];
    let mut last_error = None;
    if !search(&mut path, intermediates, trust_store, time, &mut last_error) {
        return Err(last_error.unwrap_or(Error::CertsVerifyUntrustedCert));
    }

    // The audio-only policy on any certificate constrains the whole
    // chain.
    let policy = if path.iter().any(|cert| cert.has_policy_oid(&AUDIO_ONLY_POLICY_OID)) {
        DevicePolicy::AudioOnly
    } else {
        DevicePolicy::Unrestricted
    };

    Ok(CertificatePath { path, policy })
}

/// Verifies a DER-encoded device certificate chain and returns the
/// verification context for the target plus the chain's policy.
pub fn verify_device_cert(
    certs_der: &[Vec<u8>],
    time: &GeneralizedTime,
    trust_store: &TrustStore,
) -> Result<(VerificationContext, DevicePolicy)> {
    if certs_der.is_empty() {
        return Err(Error::CertsMissing);
    }

    let mut chain: Vec<CertHandle> = Vec::with_capacity(certs_der.len());
    for der in certs_der {
        chain.push(Arc::new(crate::cert::parsed::X509Cert::from_der(der)?));
    }

    let result = find_certificate_path(&chain, time, trust_store)?;

    let target = &result.path[0];
    check_target_restrictions(target.as_ref())?;

    Ok((
        VerificationContext {
            cert: target.clone(),
        },
        result.policy,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::parsed::{BasicConstraints, KeyUsage};

    /// A synthetic certificate whose "signature" is valid when it equals
    /// `fake_signature(issuer_name, tbs)`.
    struct FakeCert {
        subject: Vec<u8>,
        issuer: Vec<u8>,
        signature: Vec<u8>,
        not_before: GeneralizedTime,
        not_after: GeneralizedTime,
        key_usage: Option<KeyUsage>,
        basic_constraints: Option<BasicConstraints>,
        policies: Vec<Vec<u8>>,
        bits: usize,
        common_name: String,
    }

    fn fake_signature(issuer: &[u8], tbs: &[u8]) -> Vec<u8> {
        let mut sig = b"sig:".to_vec();
        sig.extend_from_slice(issuer);
        sig.push(b':');
        sig.extend_from_slice(tbs);
        sig
    }

    fn year(y: u16) -> GeneralizedTime {
        GeneralizedTime {
            year: y,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        }
    }

    impl ParsedCertificate for FakeCert {
        fn serialize_to_der(&self, front_padding: usize) -> Vec<u8> {
            let mut out = vec![0u8; front_padding];
            out.extend_from_slice(&self.subject);
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
            &self.subject
        }
        fn serial_number(&self) -> crate::errors::Result<u64> {
            Ok(1)
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
            self.policies.iter().any(|p| p == oid)
        }
        fn public_key_bits(&self) -> usize {
            self.bits
        }
        fn signature_digest(&self) -> Option<DigestAlgorithm> {
            Some(DigestAlgorithm::Sha256)
        }
        fn signature_algorithms_match(&self) -> bool {
            true
        }
        fn tbs_der(&self) -> &[u8] {
            &self.subject
        }
        fn signature(&self) -> &[u8] {
            &self.signature
        }
        fn verify_signed_data(
            &self,
            _algorithm: DigestAlgorithm,
            data: &[u8],
            signature: &[u8],
        ) -> bool {
            signature == fake_signature(&self.subject, data).as_slice()
        }
    }

    struct CertSpec {
        subject: &'static str,
        issuer: &'static str,
        ca: bool,
        path_len: Option<u32>,
        audio_only: bool,
        bits: usize,
        expires: u16,
    }

    impl Default for CertSpec {
        fn default() -> CertSpec {
            CertSpec {
                subject: "",
                issuer: "",
                ca: false,
                path_len: None,
                audio_only: false,
                bits: 2048,
                expires: 2030,
            }
        }
    }

    fn cert(spec: CertSpec) -> CertHandle {
        let mut policies = Vec::new();
        if spec.audio_only {
            policies.push(AUDIO_ONLY_POLICY_OID.to_vec());
        }
        Arc::new(FakeCert {
            subject: spec.subject.as_bytes().to_vec(),
            issuer: spec.issuer.as_bytes().to_vec(),
            signature: fake_signature(spec.issuer.as_bytes(), spec.subject.as_bytes()),
            not_before: year(2020),
            not_after: year(spec.expires),
            key_usage: Some(KeyUsage {
                digital_signature: !spec.ca,
                key_cert_sign: spec.ca,
            }),
            basic_constraints: spec.ca.then_some(BasicConstraints {
                ca: true,
                path_len: spec.path_len,
            }),
            policies,
            bits: spec.bits,
            common_name: spec.subject.to_string(),
        })
    }

    fn simple_chain() -> (Vec<CertHandle>, TrustStore) {
        let target = cert(CertSpec {
            subject: "device",
            issuer: "intermediate",
            ..CertSpec::default()
        });
        let intermediate = cert(CertSpec {
            subject: "intermediate",
            issuer: "root",
            ca: true,
            ..CertSpec::default()
        });
        let root = cert(CertSpec {
            subject: "root",
            issuer: "root",
            ca: true,
            ..CertSpec::default()
        });
        (vec![target, intermediate], TrustStore::new(vec![root]))
    }

    #[test]
    fn valid_chain_verifies() {
        let (chain, store) = simple_chain();
        let result = find_certificate_path(&chain, &year(2025), &store).unwrap();
        assert_eq!(result.path.len(), 3);
        assert_eq!(result.policy, DevicePolicy::Unrestricted);
        assert_eq!(result.path[0].common_name(), "device");
    }

    #[test]
    fn empty_chain_is_missing() {
        let (_, store) = simple_chain();
        assert!(matches!(
            find_certificate_path(&[], &year(2025), &store),
            Err(Error::CertsMissing)
        ));
    }

    #[test]
    fn expired_target_is_date_invalid() {
        let (chain, store) = simple_chain();
        assert!(matches!(
            find_certificate_path(&chain, &year(2035), &store),
            Err(Error::CertsDateInvalid)
        ));
        assert!(matches!(
            find_certificate_path(&chain, &year(2019), &store),
            Err(Error::CertsDateInvalid)
        ));
    }

    #[test]
    fn expired_intermediate_is_date_invalid() {
        let target = cert(CertSpec {
            subject: "device",
            issuer: "intermediate",
            ..CertSpec::default()
        });
        let intermediate = cert(CertSpec {
            subject: "intermediate",
            issuer: "root",
            ca: true,
            expires: 2022,
            ..CertSpec::default()
        });
        let root = cert(CertSpec {
            subject: "root",
            issuer: "root",
            ca: true,
            ..CertSpec::default()
        });
        let store = TrustStore::new(vec![root]);
        assert!(matches!(
            find_certificate_path(&[target, intermediate], &year(2025), &store),
            Err(Error::CertsDateInvalid)
        ));
    }

    #[test]
    fn unknown_root_is_untrusted() {
        let (chain, _) = simple_chain();
        let other_root = cert(CertSpec {
            subject: "someone-else",
            issuer: "someone-else",
            ca: true,
            ..CertSpec::default()
        });
        let store = TrustStore::new(vec![other_root]);
        assert!(matches!(
            find_certificate_path(&chain, &year(2025), &store),
            Err(Error::CertsVerifyUntrustedCert)
        ));
    }

    #[test]
    fn root_pathlen_violation() {
        let target = cert(CertSpec {
            subject: "device",
            issuer: "a",
            ..CertSpec::default()
        });
        let a = cert(CertSpec {
            subject: "a",
            issuer: "b",
            ca: true,
            ..CertSpec::default()
        });
        let b = cert(CertSpec {
            subject: "b",
            issuer: "root",
            ca: true,
            ..CertSpec::default()
        });
        let root = cert(CertSpec {
            subject: "root",
            issuer: "root",
            ca: true,
            path_len: Some(0),
            ..CertSpec::default()
        });
        let store = TrustStore::new(vec![root]);
        // Path of four certificates exceeds pathlen 0 (which allows the
        // root plus one issued CA plus the target).
        assert!(matches!(
            find_certificate_path(&[target, a, b], &year(2025), &store),
            Err(Error::CertsPathlen)
        ));
    }

    #[test]
    fn small_modulus_rejected() {
        let target = cert(CertSpec {
            subject: "device",
            issuer: "root",
            bits: 1024,
            ..CertSpec::default()
        });
        let root = cert(CertSpec {
            subject: "root",
            issuer: "root",
            ca: true,
            ..CertSpec::default()
        });
        let store = TrustStore::new(vec![root]);
        assert!(matches!(
            find_certificate_path(&[target], &year(2025), &store),
            Err(Error::CertsVerifyGeneric)
        ));
    }

    #[test]
    fn audio_only_policy_tags_chain() {
        let target = cert(CertSpec {
            subject: "device",
            issuer: "intermediate",
            ..CertSpec::default()
        });
        let intermediate = cert(CertSpec {
            subject: "intermediate",
            issuer: "root",
            ca: true,
            audio_only: true,
            ..CertSpec::default()
        });
        let root = cert(CertSpec {
            subject: "root",
            issuer: "root",
            ca: true,
            ..CertSpec::default()
        });
        let store = TrustStore::new(vec![root]);
        let result = find_certificate_path(&[target, intermediate], &year(2025), &store).unwrap();
        assert_eq!(result.policy, DevicePolicy::AudioOnly);
    }

    #[test]
    fn backtracks_across_duplicate_subjects() {
        // Two intermediates share a subject; only one actually signed the
        // target. The search must try both rather than give up.
        let target = cert(CertSpec {
            subject: "device",
            issuer: "intermediate",
            ..CertSpec::default()
        });
        let wrong = Arc::new(FakeCert {
            subject: b"intermediate".to_vec(),
            issuer: b"root".to_vec(),
            signature: fake_signature(b"root", b"intermediate"),
            not_before: year(2020),
            not_after: year(2030),
            key_usage: Some(KeyUsage {
                digital_signature: false,
                key_cert_sign: true,
            }),
            basic_constraints: Some(BasicConstraints {
                ca: true,
                path_len: None,
            }),
            policies: vec![],
            bits: 1024, // too small: fails chain verification
            common_name: "intermediate".to_string(),
        }) as CertHandle;
        let right = cert(CertSpec {
            subject: "intermediate",
            issuer: "root",
            ca: true,
            ..CertSpec::default()
        });
        let root = cert(CertSpec {
            subject: "root",
            issuer: "root",
            ca: true,
            ..CertSpec::default()
        });
        let store = TrustStore::new(vec![root]);

        let result =
            find_certificate_path(&[target, wrong, right], &year(2025), &store).unwrap();
        assert_eq!(result.path.len(), 3);
    }

    #[test]
    fn target_without_digital_signature_restricted() {
        let target = Arc::new(FakeCert {
            subject: b"device".to_vec(),
            issuer: b"root".to_vec(),
            signature: fake_signature(b"root", b"device"),
            not_before: year(2020),
            not_after: year(2030),
            key_usage: Some(KeyUsage {
                digital_signature: false,
                key_cert_sign: false,
            }),
            basic_constraints: None,
            policies: vec![],
            bits: 2048,
            common_name: "device".to_string(),
        }) as CertHandle;

        assert!(matches!(
            check_target_restrictions(target.as_ref()),
            Err(Error::CertsRestrictions)
        ));

        let ok = cert(CertSpec {
            subject: "device",
            issuer: "root",
            ..CertSpec::default()
        });
        assert!(check_target_restrictions(ok.as_ref()).is_ok());
    }
}

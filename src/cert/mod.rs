//! Device-certificate validation: DER parsing, chain building against a
//! trust store, policy tagging, and strict validity-time handling.

pub mod parsed;
pub mod time;
pub mod validator;

pub use parsed::{BasicConstraints, DigestAlgorithm, KeyUsage, ParsedCertificate, X509Cert};
pub use time::GeneralizedTime;
pub use validator::{
    find_certificate_path, verify_device_cert, CertificatePath, DevicePolicy, TrustStore,
    VerificationContext, AUDIO_ONLY_POLICY_OID,
};

//! Crate-wide error type and parsing helpers.

use std::io;
use thiserror::Error;

/// Constructs and returns a [`std::io::Error`] with a formatted message.
/// Used by the wire-format parsing code, where errors are I/O shaped.
#[macro_export]
macro_rules! bail {
    ($kind:ident, $($arg:tt)*) => {
        // Construct the I/O error.
        return Err(
            ::std::io::Error::new(::std::io::ErrorKind::$kind, format!($($arg)*))
        )
    };
}

/// Errors reported across subsystem boundaries.
///
/// Parse errors drop the offending record or message and are never fatal.
/// State errors leave the subsystem unchanged. Resource errors are fatal for
/// the owning subsystem and escalate to the embedder. Certificate errors are
/// the distinct sub-codes produced by chain validation.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed mDNS record, CBOR message, or ASN.1/DER structure.
    #[error("parse error: {0}")]
    Parse(#[from] io::Error),

    #[error("invalid parameter: {0}")]
    ParameterInvalid(String),

    #[error("item already exists: {0}")]
    ItemAlreadyExists(String),

    #[error("item not found: {0}")]
    ItemNotFound(String),

    /// The requested operation is not legal from the current state.
    #[error("operation invalid in current state")]
    OperationInvalid,

    /// The subsystem was torn down between scheduling and execution.
    /// Not an error from the caller's perspective, but reported distinctly.
    #[error("operation cancelled")]
    OperationCancelled,

    /// Socket creation or configuration failed. Fatal for the owning
    /// subsystem.
    #[error("socket failure: {0}")]
    Socket(String),

    /// The trust store or agent credentials could not be loaded. Fatal for
    /// the owning subsystem.
    #[error("credential load failure: {0}")]
    CredentialLoad(String),

    #[error("no certificates provided")]
    CertsMissing,

    #[error("failed to parse certificate")]
    CertsParse,

    #[error("certificate expired or not yet valid")]
    CertsDateInvalid,

    #[error("certificate path length constraint violated")]
    CertsPathlen,

    #[error("certificate chain does not terminate at a trusted root")]
    CertsVerifyUntrustedCert,

    #[error("certificate verification failed")]
    CertsVerifyGeneric,

    #[error("certificate restrictions not satisfied")]
    CertsRestrictions,

    /// SPAKE2 confirmation mismatch or other authentication failure.
    #[error("authentication failure: {0}")]
    Authentication(String),

    #[error("proof computation failed")]
    ProofComputationFailed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that should drop the offending input without
    /// affecting the subsystem that reported them.
    pub fn is_parse(&self) -> bool {
        matches!(self, Error::Parse(_))
    }
}

//! Key-derivation and fingerprint helpers used during authentication
//! bootstrap.

use crate::errors::{Error, Result};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

const SCRYPT_BLOCK_SIZE: u32 = 8;
const SCRYPT_PARALLELIZATION: u32 = 1;
const SCRYPT_KEY_LENGTH: usize = 32;
const HKDF_KEY_LENGTH: usize = 32;

/// Derives the 32-byte pre-shared key: scrypt over the password, then
/// HKDF-SHA256 expansion under the same salt.
///
/// `scrypt_cost` is the CPU/memory cost parameter N and must be a power
/// of two greater than one.
pub fn compute_hkdf_scrypt_psk(
    psk: &[u8],
    salt: &[u8],
    scrypt_cost: u64,
    hkdf_info: &[u8],
) -> Result<Vec<u8>> {
    if scrypt_cost < 2 || !scrypt_cost.is_power_of_two() {
        return Err(Error::ParameterInvalid(format!(
            "scrypt cost {} is not a power of two",
            scrypt_cost
        )));
    }
    let log_n = scrypt_cost.trailing_zeros() as u8;

    let params = scrypt::Params::new(
        log_n,
        SCRYPT_BLOCK_SIZE,
        SCRYPT_PARALLELIZATION,
        SCRYPT_KEY_LENGTH,
    )
    .map_err(|_| Error::ProofComputationFailed)?;

    let mut scrypt_key = [0u8; SCRYPT_KEY_LENGTH];
    scrypt::scrypt(psk, salt, &params, &mut scrypt_key)
        .map_err(|_| Error::ProofComputationFailed)?;

    let hkdf = Hkdf::<Sha256>::new(Some(salt), &scrypt_key);
    let mut hkdf_key = vec![0u8; HKDF_KEY_LENGTH];
    hkdf.expand(hkdf_info, &mut hkdf_key)
        .map_err(|_| Error::ProofComputationFailed)?;

    Ok(hkdf_key)
}

/// The SHA-256 fingerprint of a DER certificate, formatted as
/// colon-separated uppercase hex octets (the `pk` TXT value).
pub fn sha256_fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<String>>()
        .join(":")
}

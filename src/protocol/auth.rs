//! The password-authenticated key agreement used during connection setup.
//!
//! Each side holds a fresh 32-byte private key and exchanges its public
//! value, a point on P-256. The 64-byte shared key is the SHA-512 hash of
//! the ECDH shared secret concatenated with the password; the confirmation
//! proof is the SHA-512 hash of the shared key.

use crate::errors::{Error, Result};
use p256::ecdh;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use sha2::{Digest, Sha512};

pub const PRIVATE_KEY_LEN: usize = 32;
pub const SHARED_KEY_LEN: usize = 64;

/// A fresh random P-256 private key.
pub fn generate_private_key() -> [u8; PRIVATE_KEY_LEN] {
    let secret = SecretKey::random(&mut rand::rngs::OsRng);
    secret.to_bytes().into()
}

/// The public value for `private_key`: the uncompressed SEC1 encoding of
/// its public point.
pub fn compute_public_value(private_key: &[u8; PRIVATE_KEY_LEN]) -> Result<Vec<u8>> {
    let secret = SecretKey::from_slice(private_key)
        .map_err(|_| Error::Authentication("invalid private key".to_string()))?;
    Ok(secret
        .public_key()
        .to_encoded_point(false)
        .as_bytes()
        .to_vec())
}

/// Derives the 64-byte shared key: SHA-512 over the ECDH shared secret
/// followed by the password.
pub fn compute_shared_key(
    private_key: &[u8; PRIVATE_KEY_LEN],
    peer_public_value: &[u8],
    password: &[u8],
) -> Result<[u8; SHARED_KEY_LEN]> {
    let secret = SecretKey::from_slice(private_key)
        .map_err(|_| Error::Authentication("invalid private key".to_string()))?;
    let peer = PublicKey::from_sec1_bytes(peer_public_value)
        .map_err(|_| Error::Authentication("invalid peer public value".to_string()))?;

    let shared = ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());

    let mut hasher = Sha512::new();
    hasher.update(shared.raw_secret_bytes());
    hasher.update(password);
    Ok(hasher.finalize().into())
}

/// The confirmation proof sent to demonstrate knowledge of the shared key
/// without revealing it.
pub fn confirmation_proof(shared_key: &[u8; SHARED_KEY_LEN]) -> Vec<u8> {
    Sha512::digest(shared_key).to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two endpoints with the same password derive the same 64-byte key.
    #[test]
    fn both_sides_agree_on_shared_key() {
        let password = b"0123456789";

        let key_a = generate_private_key();
        let key_b = generate_private_key();
        let public_a = compute_public_value(&key_a).unwrap();
        let public_b = compute_public_value(&key_b).unwrap();

        let shared_a = compute_shared_key(&key_a, &public_b, password).unwrap();
        let shared_b = compute_shared_key(&key_b, &public_a, password).unwrap();
        assert_eq!(shared_a, shared_b);
        assert_eq!(shared_a.len(), SHARED_KEY_LEN);

        assert_eq!(confirmation_proof(&shared_a), confirmation_proof(&shared_b));
    }

    #[test]
    fn different_passwords_diverge() {
        let key_a = generate_private_key();
        let key_b = generate_private_key();
        let public_a = compute_public_value(&key_a).unwrap();
        let public_b = compute_public_value(&key_b).unwrap();

        let shared_a = compute_shared_key(&key_a, &public_b, b"password one").unwrap();
        let shared_b = compute_shared_key(&key_b, &public_a, b"password two").unwrap();
        assert_ne!(shared_a, shared_b);
    }

    #[test]
    fn public_value_is_uncompressed_point() {
        let key = generate_private_key();
        let public = compute_public_value(&key).unwrap();
        assert_eq!(public.len(), 65);
        assert_eq!(public[0], 0x04);
    }

    #[test]
    fn malformed_peer_value_rejected() {
        let key = generate_private_key();
        assert!(compute_shared_key(&key, &[0x02, 0x03], b"pw").is_err());
    }
}

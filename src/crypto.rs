//! # Signatures
//!
//! Domain-separated Ed25519 signing and verification for the objects path
//! servers exchange: revocation claims and path segments.
//!
//! ## Trust Model
//!
//! - Every scope signs with one Ed25519 key; verifiers map IA -> verifying key
//! - Only Ed25519 signatures are accepted
//! - Domain separation prevents a segment signature from being replayed as a
//!   revocation signature and vice versa

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use thiserror::Error;

// ============================================================================
// Signature Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature is missing")]
    Missing,
    #[error("signature has invalid length")]
    InvalidLength,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("invalid public key")]
    InvalidPublicKey,
}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// SECURITY: Each signed data type uses a unique prefix so that signatures
// cannot be reused in a different context.

/// Domain separation prefix for revocation claims.
pub const REVOCATION_SIGNATURE_DOMAIN: &[u8] = b"pathnet-revinfo-v1:";

/// Domain separation prefix for path segments.
pub const SEGMENT_SIGNATURE_DOMAIN: &[u8] = b"pathnet-segment-v1:";

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign `data` prefixed with `domain`. Returns the 64-byte signature.
pub fn sign_with_domain(key: &SigningKey, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    key.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature produced by [`sign_with_domain`].
pub fn verify_with_domain(
    key: &VerifyingKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    key.verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Parse a 32-byte hex-encoded verifying key.
pub fn verifying_key_from_hex(s: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = hex::decode(s).map_err(|_| SignatureError::InvalidPublicKey)?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| SignatureError::InvalidPublicKey)
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let key = generate_signing_key();
        let sig = sign_with_domain(&key, REVOCATION_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(sig.len(), 64);
        assert!(
            verify_with_domain(&key.verifying_key(), REVOCATION_SIGNATURE_DOMAIN, b"payload", &sig)
                .is_ok()
        );
    }

    #[test]
    fn domain_separation_prevents_replay() {
        let key = generate_signing_key();
        let sig = sign_with_domain(&key, SEGMENT_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(
            verify_with_domain(&key.verifying_key(), REVOCATION_SIGNATURE_DOMAIN, b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn wrong_key_and_bad_lengths() {
        let key = generate_signing_key();
        let other = generate_signing_key();
        let sig = sign_with_domain(&key, SEGMENT_SIGNATURE_DOMAIN, b"x");
        let vk = other.verifying_key();
        assert_eq!(
            verify_with_domain(&vk, SEGMENT_SIGNATURE_DOMAIN, b"x", &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify_with_domain(&vk, SEGMENT_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&vk, SEGMENT_SIGNATURE_DOMAIN, b"x", &sig[..10]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn verifying_key_hex_parsing() {
        let key = generate_signing_key();
        let hex_key = hex::encode(key.verifying_key().as_bytes());
        assert_eq!(verifying_key_from_hex(&hex_key).unwrap(), key.verifying_key());
        assert_eq!(verifying_key_from_hex("abcd"), Err(SignatureError::InvalidPublicKey));
    }
}

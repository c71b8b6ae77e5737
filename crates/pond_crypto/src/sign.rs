//! Ed25519 identity signatures.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::CryptoError;

pub const SIGNATURE_LEN: usize = 64;

/// Signs `msg` with a 32-byte Ed25519 seed; returns the raw 64-byte signature.
pub fn sign(key: &SigningKey, msg: &[u8]) -> [u8; SIGNATURE_LEN] {
    key.sign(msg).to_bytes()
}

/// Verifies a signature that arrived off the wire. The length must be
/// exactly 64 bytes; anything else is rejected before parsing.
pub fn verify(public: &VerifyingKey, msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    let sig_bytes: [u8; SIGNATURE_LEN] = sig
        .try_into()
        .map_err(|_| CryptoError::SignatureLength(sig.len()))?;
    let sig = Signature::from_bytes(&sig_bytes);
    public
        .verify(msg, &sig)
        .map_err(|_| CryptoError::SignatureVerification)
}

/// Parses a 32-byte Ed25519 public key.
pub fn verifying_key(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("public key is {} bytes", bytes.len())))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

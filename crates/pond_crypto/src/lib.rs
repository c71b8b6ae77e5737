//! pond_crypto — cryptographic primitives for the Pond client
//!
//! # Design principles
//! - No custom primitives below the protocol layer; curves, AEADs and hashes
//!   come from audited crates (dalek, RustCrypto, arkworks).
//! - All protocol randomness flows through one injected [`rng::SecureRng`].
//! - No I/O anywhere in this crate.
//!
//! # Module layout
//! - `boxes`   — public-key authenticated encryption (X25519 + XChaCha20-Poly1305)
//! - `sign`    — Ed25519 identity signatures
//! - `ratchet` — the two-key DH ratchet and sealed-envelope format
//! - `group`   — BBS short group signatures with revocation (BLS12-381)
//! - `rng`     — shared ChaCha20 CSPRNG facade
//! - `error`   — unified error type

pub mod boxes;
pub mod error;
pub mod group;
pub mod ratchet;
pub mod rng;
pub mod sign;

pub use error::CryptoError;
pub use rng::SecureRng;

/// SHA-256, the only digest the protocol uses.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    Sha256::digest(data).into()
}

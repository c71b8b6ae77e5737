//! Public-key authenticated encryption.
//!
//! X25519 ECDH → HKDF-SHA256 → XChaCha20-Poly1305. The shared key depends
//! only on the DH output, so `seal(m, n, B_pub, a_priv)` opens with
//! `open(c, n, A_pub, b_priv)` and vice versa.
//!
//! Nonces are 24 bytes and carried separately by the caller; the tag adds
//! [`OVERHEAD`] bytes. No I/O, no logging.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

pub const NONCE_LEN: usize = 24;
/// Poly1305 tag length.
pub const OVERHEAD: usize = 16;

const KEY_INFO: &[u8] = b"pond-box-v1";

fn shared_key(their_pub: &PublicKey, my_priv: &StaticSecret) -> [u8; 32] {
    let dh = my_priv.diffie_hellman(their_pub);
    let hk = Hkdf::<Sha256>::new(None, dh.as_bytes());
    let mut key = [0u8; 32];
    hk.expand(KEY_INFO, &mut key)
        .expect("32 bytes is a valid HKDF output length");
    key
}

/// Encrypts and authenticates `plaintext`. Output is `plaintext.len() +
/// OVERHEAD` bytes and does not include the nonce.
pub fn seal(
    plaintext: &[u8],
    nonce: &[u8; NONCE_LEN],
    their_pub: &PublicKey,
    my_priv: &StaticSecret,
) -> Vec<u8> {
    let key = shared_key(their_pub, my_priv);
    let cipher = XChaCha20Poly1305::new_from_slice(&key).expect("32-byte key");
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .expect("in-memory encryption cannot fail")
}

/// Authenticates and decrypts `sealed`. Returns `None` if the tag does not
/// verify under this key pair — callers treat that as "wrong keys" and try
/// the next combination.
pub fn open(
    sealed: &[u8],
    nonce: &[u8; NONCE_LEN],
    their_pub: &PublicKey,
    my_priv: &StaticSecret,
) -> Option<Vec<u8>> {
    if sealed.len() < OVERHEAD {
        return None;
    }
    let key = shared_key(their_pub, my_priv);
    let cipher = XChaCha20Poly1305::new_from_slice(&key).expect("32-byte key");
    cipher.decrypt(XNonce::from_slice(nonce), sealed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::SecureRng;

    fn keypair(rng: &SecureRng) -> (StaticSecret, PublicKey) {
        let secret = StaticSecret::from(rng.random_array::<32>());
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    #[test]
    fn seal_open_roundtrip_both_orientations() {
        let rng = SecureRng::from_seed([1; 32]);
        let (a_priv, a_pub) = keypair(&rng);
        let (b_priv, b_pub) = keypair(&rng);
        let nonce = rng.random_array::<NONCE_LEN>();

        let sealed = seal(b"hello pond", &nonce, &b_pub, &a_priv);
        assert_eq!(sealed.len(), 10 + OVERHEAD);
        let opened = open(&sealed, &nonce, &a_pub, &b_priv).unwrap();
        assert_eq!(opened, b"hello pond");
    }

    #[test]
    fn wrong_keys_fail() {
        let rng = SecureRng::from_seed([2; 32]);
        let (a_priv, _) = keypair(&rng);
        let (_, b_pub) = keypair(&rng);
        let (c_priv, _) = keypair(&rng);
        let nonce = rng.random_array::<NONCE_LEN>();

        let sealed = seal(b"secret", &nonce, &b_pub, &a_priv);
        assert!(open(&sealed, &nonce, &b_pub, &c_priv).is_none());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let rng = SecureRng::from_seed([3; 32]);
        let (a_priv, a_pub) = keypair(&rng);
        let (b_priv, b_pub) = keypair(&rng);
        let nonce = rng.random_array::<NONCE_LEN>();

        let mut sealed = seal(b"secret", &nonce, &b_pub, &a_priv);
        sealed[0] ^= 1;
        assert!(open(&sealed, &nonce, &a_pub, &b_priv).is_none());
    }
}

//! Two-key DH ratchet.
//!
//! Each contact holds two X25519 secrets of ours (`last`, `current`) and the
//! two public values we know of theirs. A peer always seals to the newest
//! public value they have seen from us; as soon as a message proves they have
//! seen `current`, we rotate: `last ← current`, `current ← fresh`.
//!
//! Sealed envelope layout (lengths in bytes):
//!
//!   version ≥ 1:  [ outer nonce 24 | boxed ephemeral 32+16 | inner nonce 24 | boxed payload n+16 ]
//!   version 0:    [ inner nonce 24 | boxed payload n+16 ]
//!
//! The outer block carries a one-shot ephemeral public key boxed from our
//! `last` secret to their `current` public; the payload is then boxed from
//! the ephemeral secret, so a passive observer never sees a ciphertext
//! bound to our long-term DH value.

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::boxes::{self, NONCE_LEN, OVERHEAD};
use crate::rng::SecureRng;

/// Outer nonce plus the boxed 32-byte ephemeral public key.
pub const EPHEMERAL_BLOCK_LEN: usize = NONCE_LEN + 32 + OVERHEAD;

/// Sealed length for a padded payload of `n` bytes at the given version.
pub const fn sealed_len(version: u32, padded_len: usize) -> usize {
    let inner = NONCE_LEN + padded_len + OVERHEAD;
    if version >= 1 {
        EPHEMERAL_BLOCK_LEN + inner
    } else {
        inner
    }
}

/// DH ratchet state for one contact. Serialized inside the encrypted state
/// file; secrets zeroize on drop via `StaticSecret`.
#[derive(Serialize, Deserialize)]
pub struct DhRatchet {
    #[serde(with = "secret_bytes")]
    last_private: StaticSecret,
    #[serde(with = "secret_bytes")]
    current_private: StaticSecret,
    #[serde(with = "public_bytes")]
    their_last_public: PublicKey,
    #[serde(with = "public_bytes")]
    their_current_public: PublicKey,
}

impl DhRatchet {
    /// Fresh state for a new contact. Both of our slots start on the same
    /// scalar — the one we announce during key exchange — and separate on
    /// the first rotation. The peer's slots are filled by
    /// [`DhRatchet::set_their_public`] when their key-exchange block arrives.
    pub fn new(rng: &SecureRng) -> Self {
        let secret = StaticSecret::from(rng.random_array::<32>());
        let copy = StaticSecret::from(secret.to_bytes());
        Self {
            last_private: secret,
            current_private: copy,
            their_last_public: PublicKey::from([0u8; 32]),
            their_current_public: PublicKey::from([0u8; 32]),
        }
    }

    /// The public value to advertise: the peer should seal to this next.
    pub fn current_public(&self) -> [u8; 32] {
        PublicKey::from(&self.current_private).to_bytes()
    }

    /// Installs the peer's announced DH public after key exchange.
    pub fn set_their_public(&mut self, public: [u8; 32]) {
        self.their_last_public = PublicKey::from(public);
        self.their_current_public = PublicKey::from(public);
    }

    /// Seals a padded payload to this contact.
    pub fn seal(&self, version: u32, padded: &[u8], rng: &SecureRng) -> Vec<u8> {
        let inner_nonce = rng.random_array::<NONCE_LEN>();
        let mut sealed = Vec::with_capacity(sealed_len(version, padded.len()));

        let inner_private;
        if version >= 1 {
            let ephemeral = StaticSecret::from(rng.random_array::<32>());
            let ephemeral_public = PublicKey::from(&ephemeral);
            let outer_nonce = rng.random_array::<NONCE_LEN>();
            sealed.extend_from_slice(&outer_nonce);
            sealed.extend_from_slice(&boxes::seal(
                ephemeral_public.as_bytes(),
                &outer_nonce,
                &self.their_current_public,
                &self.last_private,
            ));
            inner_private = ephemeral;
        } else {
            inner_private = StaticSecret::from(self.last_private.to_bytes());
        }

        sealed.extend_from_slice(&inner_nonce);
        sealed.extend_from_slice(&boxes::seal(
            padded,
            &inner_nonce,
            &self.their_current_public,
            &inner_private,
        ));
        sealed
    }

    /// Opens a sealed envelope, advancing the ratchet when the ciphertext
    /// proves the peer has seen our current DH value. Returns `None` on any
    /// failure; state is only mutated on a successful authenticated open.
    pub fn open(&mut self, sealed: &[u8], rng: &SecureRng) -> Option<Vec<u8>> {
        if sealed.len() < NONCE_LEN + OVERHEAD {
            return None;
        }
        let nonce: [u8; NONCE_LEN] = sealed[..NONCE_LEN].try_into().unwrap();
        let rest = &sealed[NONCE_LEN..];

        if let Some(plaintext) = self.open_ladder(rest, &nonce, rng) {
            return Some(plaintext);
        }

        // No direct hit: the envelope may carry an ephemeral block. Its
        // leading nonce was already split off above.
        let header_len = EPHEMERAL_BLOCK_LEN - NONCE_LEN;
        if rest.len() <= header_len + NONCE_LEN {
            return None;
        }
        let public = self.open_ladder(&rest[..header_len], &nonce, rng)?;
        if public.len() != 32 {
            return None;
        }
        let ephemeral = PublicKey::from(<[u8; 32]>::try_from(&public[..]).unwrap());
        let inner_nonce: [u8; NONCE_LEN] =
            rest[header_len..header_len + NONCE_LEN].try_into().unwrap();
        let inner = &rest[header_len + NONCE_LEN..];

        if let Some(plaintext) = boxes::open(inner, &inner_nonce, &ephemeral, &self.last_private) {
            return Some(plaintext);
        }
        let plaintext = boxes::open(inner, &inner_nonce, &ephemeral, &self.current_private)?;
        self.rotate(rng);
        Some(plaintext)
    }

    /// The peer told us which DH value they will use next. A change shifts
    /// their window. The caller validates the length; this takes 32 bytes.
    pub fn observe_their_next(&mut self, next: [u8; 32]) {
        if next != self.their_current_public.to_bytes() {
            self.their_last_public = self.their_current_public;
            self.their_current_public = PublicKey::from(next);
        }
    }

    /// Tries the four (their public × our secret) combinations in fixed
    /// order, rotating whenever the secret that worked is our current one.
    /// Before the first rotation `last` and `current` are the same scalar,
    /// so a hit on `last` still counts as evidence for `current`.
    fn open_ladder(
        &mut self,
        sealed: &[u8],
        nonce: &[u8; NONCE_LEN],
        rng: &SecureRng,
    ) -> Option<Vec<u8>> {
        let combos = [
            (self.their_last_public, false),
            (self.their_current_public, false),
            (self.their_last_public, true),
            (self.their_current_public, true),
        ];
        for (their_public, use_current) in combos {
            let secret = if use_current {
                &self.current_private
            } else {
                &self.last_private
            };
            if let Some(plaintext) = boxes::open(sealed, nonce, &their_public, secret) {
                if use_current || self.last_private.to_bytes() == self.current_private.to_bytes() {
                    self.rotate(rng);
                }
                return Some(plaintext);
            }
        }
        None
    }

    fn rotate(&mut self, rng: &SecureRng) {
        self.last_private = StaticSecret::from(self.current_private.to_bytes());
        loop {
            let fresh = StaticSecret::from(rng.random_array::<32>());
            if fresh.to_bytes() != self.last_private.to_bytes() {
                self.current_private = fresh;
                break;
            }
        }
    }

    #[cfg(any(test, feature = "test_utils"))]
    pub fn keys_distinct(&self) -> bool {
        self.last_private.to_bytes() != self.current_private.to_bytes()
    }
}

mod secret_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use x25519_dalek::StaticSecret;

    pub fn serialize<S: Serializer>(secret: &StaticSecret, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(&secret.to_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<StaticSecret, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(de)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32-byte DH secret"))?;
        Ok(StaticSecret::from(arr))
    }
}

mod public_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use x25519_dalek::PublicKey;

    pub fn serialize<S: Serializer>(key: &PublicKey, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(key.as_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<PublicKey, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(de)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32-byte DH public"))?;
        Ok(PublicKey::from(arr))
    }
}

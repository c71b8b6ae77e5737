//! Fixed-size payload padding.
//!
//! Every sealed envelope carries exactly [`PADDED_LEN`] bytes of plaintext:
//! a little-endian length prefix, the encoded message, and random fill. The
//! ciphertext length therefore leaks nothing about the message length.
//!
//! Format: [ len: u32 LE | message | random padding ]

use pond_crypto::ratchet;
use pond_crypto::SecureRng;

use crate::error::ProtoError;

/// Maximum encoded message size. One process-wide constant; both peers of a
/// conversation derive their envelope sizes from it.
pub const MAX_SERIALIZED: usize = 16 * 1024;

/// Length of every padded plaintext.
pub const PADDED_LEN: usize = MAX_SERIALIZED + 4;

/// Envelope sizes per version, for traffic-shape checks.
pub const SEALED_LEN_V0: usize = ratchet::sealed_len(0, PADDED_LEN);
pub const SEALED_LEN_V1: usize = ratchet::sealed_len(1, PADDED_LEN);

/// Smallest envelope worth attempting to unseal: a nonce and a tag.
pub const MIN_SEALED_LEN: usize = 24 + 16;

/// Pads an encoded message to the fixed plaintext size.
pub fn pad_payload(message: &[u8], rng: &SecureRng) -> Result<Vec<u8>, ProtoError> {
    if message.len() > MAX_SERIALIZED {
        return Err(ProtoError::MessageTooLarge);
    }
    let mut out = vec![0u8; PADDED_LEN];
    out[..4].copy_from_slice(&(message.len() as u32).to_le_bytes());
    out[4..4 + message.len()].copy_from_slice(message);
    rng.fill_bytes(&mut out[4 + message.len()..]);
    Ok(out)
}

/// Recovers the message from a padded plaintext.
pub fn unpad(padded: &[u8]) -> Result<&[u8], ProtoError> {
    if padded.len() < 4 {
        return Err(ProtoError::InvalidPadding("too short for length prefix"));
    }
    let len = u32::from_le_bytes(padded[..4].try_into().unwrap()) as usize;
    if len > padded.len() - 4 {
        return Err(ProtoError::InvalidPadding("length prefix exceeds data"));
    }
    Ok(&padded[4..4 + len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_unpad_roundtrip() {
        let rng = SecureRng::from_seed([30; 32]);
        let msg = b"a short message";
        let padded = pad_payload(msg, &rng).unwrap();
        assert_eq!(padded.len(), PADDED_LEN);
        assert_eq!(unpad(&padded).unwrap(), msg);
    }

    #[test]
    fn empty_message_still_fills_the_envelope() {
        let rng = SecureRng::from_seed([31; 32]);
        let padded = pad_payload(b"", &rng).unwrap();
        assert_eq!(padded.len(), PADDED_LEN);
        assert_eq!(unpad(&padded).unwrap(), b"");
    }

    #[test]
    fn max_size_fits_and_one_more_does_not() {
        let rng = SecureRng::from_seed([32; 32]);
        let max = vec![0x11; MAX_SERIALIZED];
        let padded = pad_payload(&max, &rng).unwrap();
        assert_eq!(unpad(&padded).unwrap(), &max[..]);

        let over = vec![0x11; MAX_SERIALIZED + 1];
        assert!(matches!(
            pad_payload(&over, &rng),
            Err(ProtoError::MessageTooLarge)
        ));
    }

    #[test]
    fn corrupt_length_prefix_is_rejected() {
        let rng = SecureRng::from_seed([33; 32]);
        let mut padded = pad_payload(b"x", &rng).unwrap();
        padded[..4].copy_from_slice(&(PADDED_LEN as u32).to_le_bytes());
        assert!(unpad(&padded).is_err());
        assert!(unpad(&[1, 0]).is_err());
    }

    #[test]
    fn sealed_lengths_differ_by_the_ephemeral_block() {
        assert_eq!(SEALED_LEN_V0, 24 + PADDED_LEN + 16);
        assert_eq!(SEALED_LEN_V1, SEALED_LEN_V0 + ratchet::EPHEMERAL_BLOCK_LEN);
    }
}

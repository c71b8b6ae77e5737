//! Contacts and their lifecycle.
//!
//! A contact is created `pending` when the user picks a name, becomes
//! active when the peer's key-exchange block has been processed, and can
//! end up `revoked` (we cut them off: outbound dead) or `revoked_us` (they
//! cut us off: inbound dead).
//!
//! Two member keys live here and they are not the same thing:
//! - `issued_key` is the credential *we* issued this contact from *our*
//!   group. Their messages to us are signed with it; its tag is how we
//!   recognize the sender.
//! - `my_group_key` is *our* credential in *their* group, received during
//!   key exchange. Our deliveries to them are signed with it.

use serde::{Deserialize, Serialize};

use pond_crypto::group::{MemberKey, Tag};
use pond_crypto::ratchet::DhRatchet;

/// A tag this contact used before a revocation rotated our group. Kept so
/// late-arriving messages signed under the old credential still resolve;
/// entries are never pruned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviousTag {
    pub tag: Tag,
    /// Seconds since the epoch when the tag stopped being current.
    pub expired: i64,
}

#[derive(Serialize, Deserialize)]
pub struct Contact {
    /// Process-unique random id; every cross-reference uses it.
    pub id: u64,
    /// User-chosen, unique.
    pub name: String,
    pub their_identity_public: [u8; 32],
    /// Ed25519, verifies their revocation signatures.
    pub their_signing_public: [u8; 32],
    pub their_server: String,
    /// Credential we issued them from our group.
    pub issued_key: MemberKey,
    /// Our credential in their group; `None` until key exchange completes.
    pub my_group_key: Option<MemberKey>,
    /// Their group's generation, as far as we know.
    pub generation: u32,
    pub ratchet: DhRatchet,
    pub previous_tags: Vec<PreviousTag>,
    /// Envelope version negotiated downwards from ours.
    pub supported_version: u32,
    pub is_pending: bool,
    pub revoked: bool,
    pub revoked_us: bool,
    /// Opaque handshake material while the exchange is in flight; cleared
    /// on completion and on the first fully-processed message.
    pub kxs_bytes: Option<Vec<u8>>,
}

/// What the external key-exchange parser hands us once the peer's block is
/// valid. Everything an active contact needs beyond what we generated
/// ourselves.
pub struct KeyExchangeOutcome {
    pub their_identity_public: [u8; 32],
    pub their_signing_public: [u8; 32],
    pub their_server: String,
    /// The DH value they announced; seeds both slots of their window.
    pub their_dh_public: [u8; 32],
    /// Our membership in their group.
    pub my_group_key: MemberKey,
    /// Their group's generation at exchange time.
    pub generation: u32,
    pub supported_version: u32,
}

impl Contact {
    /// True once messages can flow in both directions.
    pub fn is_active(&self) -> bool {
        !self.is_pending && !self.revoked && !self.revoked_us
    }

    /// Does `tag` identify this contact, under its current credential or
    /// any it held before a revocation?
    pub fn matches_tag(&self, tag: &Tag) -> bool {
        self.issued_key.tag() == *tag || self.previous_tags.iter().any(|p| p.tag == *tag)
    }

    pub(crate) fn complete_key_exchange(&mut self, outcome: KeyExchangeOutcome) {
        self.their_identity_public = outcome.their_identity_public;
        self.their_signing_public = outcome.their_signing_public;
        self.their_server = outcome.their_server;
        self.ratchet.set_their_public(outcome.their_dh_public);
        self.my_group_key = Some(outcome.my_group_key);
        self.generation = outcome.generation;
        self.supported_version = outcome.supported_version;
        self.is_pending = false;
        self.kxs_bytes = None;
    }
}

//! The persisted client state.
//!
//! Everything here round-trips through serde; the encrypted container it
//! is stored in belongs to an external collaborator. The orchestrator owns
//! the live copy exclusively and schedules a save after every mutation.

use std::collections::HashMap;

use chrono::Utc;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use pond_crypto::group::GroupPrivateKey;
use pond_crypto::ratchet::DhRatchet;
use pond_crypto::SecureRng;
use pond_proto::wire::Message;

use crate::contact::Contact;
use crate::error::ClientError;

/// Our long-term identity: the X25519 scalar that names us to servers, the
/// Ed25519 key that signs revocations, and where our mailbox lives.
#[derive(Serialize, Deserialize)]
pub struct Identity {
    #[serde(with = "dh_secret_bytes")]
    pub secret: StaticSecret,
    pub public: [u8; 32],
    #[serde(with = "signing_key_bytes")]
    pub signing: SigningKey,
    pub server: String,
}

impl Identity {
    pub fn generate(rng: &SecureRng, server: String) -> Self {
        let secret = StaticSecret::from(rng.random_array::<32>());
        let public = PublicKey::from(&secret).to_bytes();
        let signing = SigningKey::from_bytes(&rng.random_array::<32>());
        Identity {
            secret,
            public,
            signing,
            server,
        }
    }
}

/// A group private key retained after a revocation so that in-flight
/// messages signed under the old generation can still be verified. Never
/// pruned; the expiration records when it stopped being current.
#[derive(Clone, Serialize, Deserialize)]
pub struct PreviousGroupPrivateKey {
    pub key: GroupPrivateKey,
    pub expired: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: u64,
    /// Sender contact id; 0 means a home-server announcement.
    pub from: u64,
    pub received_time: i64,
    pub read: bool,
    pub acked: bool,
    /// Still-sealed ciphertext, kept while the sender's key exchange is
    /// pending. Cleared once decoded.
    pub sealed: Option<Vec<u8>>,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: u64,
    pub to: u64,
    pub server: String,
    pub created: i64,
    /// Set when the server accepted the request.
    pub sent: Option<i64>,
    /// Set when a later inbound message referenced this id.
    pub acked: Option<i64>,
    pub revocation: bool,
    /// Plaintext retained for redisplay; revocations carry none.
    pub message: Option<Message>,
    /// The recipient revoked us before this could be delivered.
    pub undeliverable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: u64,
    pub to: Option<u64>,
    pub body: String,
    pub created: i64,
}

#[derive(Serialize, Deserialize)]
pub struct State {
    pub identity: Identity,
    pub group_priv: GroupPrivateKey,
    pub previous_group_privs: Vec<PreviousGroupPrivateKey>,
    /// Our group's generation; strictly increases on every local revocation.
    pub generation: u32,
    pub contacts: HashMap<u64, Contact>,
    pub inbox: Vec<InboxMessage>,
    pub outbox: Vec<OutboxMessage>,
    pub drafts: Vec<Draft>,
}

impl State {
    pub fn new(rng: &SecureRng, server: String) -> Self {
        State {
            identity: Identity::generate(rng, server),
            group_priv: GroupPrivateKey::generate(rng),
            previous_group_privs: Vec::new(),
            // Random starting point so generations are not comparable
            // across accounts.
            generation: rng.random_id() as u32,
            contacts: HashMap::new(),
            inbox: Vec::new(),
            outbox: Vec::new(),
            drafts: Vec::new(),
        }
    }

    /// Creates a pending contact. The name must be unused; the member
    /// credential issued here travels to the peer in our key-exchange block.
    pub fn new_contact(&mut self, name: &str, rng: &SecureRng) -> Result<u64, ClientError> {
        if self.contacts.values().any(|c| c.name == name) {
            return Err(ClientError::DuplicateName);
        }
        let id = loop {
            let id = rng.random_id();
            if !self.contacts.contains_key(&id) {
                break id;
            }
        };
        self.contacts.insert(
            id,
            Contact {
                id,
                name: name.to_string(),
                their_identity_public: [0; 32],
                their_signing_public: [0; 32],
                their_server: String::new(),
                issued_key: self.group_priv.new_member(rng),
                my_group_key: None,
                generation: 0,
                ratchet: DhRatchet::new(rng),
                previous_tags: Vec::new(),
                supported_version: 0,
                is_pending: true,
                revoked: false,
                revoked_us: false,
                kxs_bytes: None,
            },
        );
        Ok(id)
    }

    pub fn contact(&self, id: u64) -> Result<&Contact, ClientError> {
        self.contacts.get(&id).ok_or(ClientError::NoSuchContact)
    }

    pub fn contact_mut(&mut self, id: u64) -> Result<&mut Contact, ClientError> {
        self.contacts.get_mut(&id).ok_or(ClientError::NoSuchContact)
    }

    /// Resolves a group-signature tag to a contact, checking current
    /// credentials before previous ones.
    pub fn contact_by_tag(&self, tag: &pond_crypto::group::Tag) -> Option<&Contact> {
        if let Some(contact) = self
            .contacts
            .values()
            .find(|c| c.issued_key.tag() == *tag)
        {
            return Some(contact);
        }
        self.contacts
            .values()
            .find(|c| c.previous_tags.iter().any(|p| p.tag == *tag))
    }

    pub fn outbox_mut(&mut self, id: u64) -> Option<&mut OutboxMessage> {
        self.outbox.iter_mut().find(|m| m.id == id)
    }

    pub fn now() -> i64 {
        Utc::now().timestamp()
    }
}

mod dh_secret_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use x25519_dalek::StaticSecret;

    pub fn serialize<S: Serializer>(secret: &StaticSecret, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(&secret.to_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<StaticSecret, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(de)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32-byte identity secret"))?;
        Ok(StaticSecret::from(arr))
    }
}

mod signing_key_bytes {
    use ed25519_dalek::SigningKey;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &SigningKey, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_bytes(&key.to_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<SigningKey, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(de)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32-byte signing key"))?;
        Ok(SigningKey::from_bytes(&arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_names_are_unique() {
        let rng = SecureRng::from_seed([80; 32]);
        let mut state = State::new(&rng, "pondserver://x@localhost".into());
        state.new_contact("alice", &rng).unwrap();
        assert!(matches!(
            state.new_contact("alice", &rng),
            Err(ClientError::DuplicateName)
        ));
        state.new_contact("bob", &rng).unwrap();
        assert_eq!(state.contacts.len(), 2);
    }

    #[test]
    fn new_contacts_start_pending() {
        let rng = SecureRng::from_seed([81; 32]);
        let mut state = State::new(&rng, "pondserver://x@localhost".into());
        let id = state.new_contact("carol", &rng).unwrap();
        let contact = state.contact(id).unwrap();
        assert!(contact.is_pending);
        assert!(!contact.is_active());
        assert!(contact.my_group_key.is_none());
    }

    #[test]
    fn state_round_trips_through_serde() {
        let rng = SecureRng::from_seed([82; 32]);
        let mut state = State::new(&rng, "pondserver://x@localhost".into());
        let id = state.new_contact("dave", &rng).unwrap();
        state.inbox.push(InboxMessage {
            id: 1,
            from: id,
            received_time: 99,
            read: false,
            acked: false,
            sealed: Some(vec![1, 2, 3]),
            message: None,
        });

        let bytes = bincode::serialize(&state).unwrap();
        let restored: State = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.generation, state.generation);
        assert_eq!(restored.contacts.len(), 1);
        assert_eq!(restored.contact(id).unwrap().name, "dave");
        assert_eq!(restored.inbox[0].sealed.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(
            restored.identity.secret.to_bytes(),
            state.identity.secret.to_bytes()
        );
    }
}

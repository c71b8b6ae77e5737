//! The receive path: fetched envelopes and server announcements.
//!
//! Verification order for a fetched envelope: current group first, then
//! every retained previous group private key. Whichever generation
//! verifies, the signature is opened under the *current* private — opening
//! is tag extraction and the trapdoor survives generational updates — and
//! the recovered tag resolves through current credentials before
//! `previous_tags`.
//!
//! Nothing cryptographically suspect ever reaches the interface: bad
//! signatures, unknown tags, undersized ciphertexts, and malformed
//! plaintexts are logged and dropped.

use tracing::{error, info};

use pond_crypto::group::GroupSignature;
use pond_crypto::sha256;
use pond_net::NewMessage;
use pond_proto::codec;
use pond_proto::wire::{self, Announce, Fetched, Message};

use crate::client::Client;
use crate::events::{ClientEvent, Indicator};
use crate::state::{InboxMessage, State};

impl Client {
    /// Entry point for the worker's synchronous hand-off. The ack is sent
    /// once state is fully updated, which is what keeps inbound processing
    /// in wire order.
    pub fn process_new_message(&mut self, event: NewMessage) {
        if let Some(fetched) = event.fetched {
            self.process_fetch(fetched);
        } else if let Some(announce) = event.announce {
            self.process_announce(announce);
        }
        let _ = event.ack.send(());
    }

    fn process_fetch(&mut self, fetched: Fetched) {
        let digest = sha256(&fetched.message);
        let Ok(signature) = GroupSignature::from_bytes(&fetched.signature) else {
            error!("received message with unparseable group signature");
            return;
        };

        let verified = self.state.group_priv.verify(&digest, &signature)
            || self
                .state
                .previous_group_privs
                .iter()
                .any(|previous| previous.key.verify(&digest, &signature));
        if !verified {
            error!("received message with bad group signature");
            return;
        }
        let tag = self.state.group_priv.open(&signature);

        let Some(from) = self.state.contact_by_tag(&tag) else {
            error!("message from unknown contact, dropping");
            return;
        };
        let (from_id, from_pending) = (from.id, from.is_pending);
        if from.revoked {
            // Messages can still be queued server-side from before the
            // revocation.
            error!(contact = %from.name, "message from revoked contact, dropping");
            return;
        }

        if fetched.message.len() < codec::MIN_SEALED_LEN {
            error!("message too small to process");
            return;
        }

        let mut entry = InboxMessage {
            id: self.rng().random_id(),
            from: from_id,
            received_time: State::now(),
            read: false,
            acked: false,
            sealed: Some(fetched.message),
            message: None,
        };

        if !from_pending {
            let sealed = entry.sealed.take().expect("just stored");
            let Some(message) = self.unseal(entry.id, from_id, &sealed) else {
                return;
            };
            if !message.body.is_empty() {
                self.emit(ClientEvent::InboxAdded {
                    id: entry.id,
                    from: from_id,
                    indicator: Indicator::Blue,
                });
            }
            entry.message = Some(message);
        } else {
            // Keep it sealed until the key exchange completes.
            self.emit(ClientEvent::InboxAdded {
                id: entry.id,
                from: from_id,
                indicator: Indicator::Red,
            });
        }

        self.state.inbox.push(entry);
        self.save();
    }

    fn process_announce(&mut self, announce: Announce) {
        let entry = InboxMessage {
            id: self.rng().random_id(),
            from: 0,
            received_time: State::now(),
            read: false,
            acked: false,
            sealed: None,
            message: Some(announce.message),
        };
        self.emit(ClientEvent::InboxAdded {
            id: entry.id,
            from: 0,
            indicator: Indicator::Blue,
        });
        self.state.inbox.push(entry);
        self.save();
    }

    /// Decrypts and validates one sealed envelope from an active contact.
    /// Returns the decoded message, or `None` if it must be dropped.
    /// Ratchet state advances only on an authenticated open.
    pub(crate) fn unseal(
        &mut self,
        inbox_id: u64,
        from_id: u64,
        sealed: &[u8],
    ) -> Option<Message> {
        let rng = self.rng().clone();
        let plaintext = {
            let contact = self
                .state
                .contacts
                .get_mut(&from_id)
                .expect("unseal caller resolved the contact");
            assert!(
                !contact.is_pending,
                "was asked to unseal message from pending contact"
            );
            contact.ratchet.open(sealed, &rng)
        };
        let Some(plaintext) = plaintext else {
            error!("failed to decrypt message");
            return None;
        };

        let body = match codec::unpad(&plaintext) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "plaintext length incorrect");
                return None;
            }
        };
        let message: Message = match wire::decode(body) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "failed to parse message");
                return None;
            }
        };

        let Ok(next_dh) = <[u8; 32]>::try_from(message.my_next_dh.as_slice()) else {
            error!(len = message.my_next_dh.len(), "message with bad DH length");
            return None;
        };

        // Duplicate suppression: the sender may have retransmitted.
        let duplicate = self.state.inbox.iter().any(|candidate| {
            candidate.from == from_id
                && candidate.id != inbox_id
                && candidate
                    .message
                    .as_ref()
                    .is_some_and(|m| m.id == message.id)
        });
        if duplicate {
            info!("dropping duplicate message");
            return None;
        }

        {
            let contact = self
                .state
                .contacts
                .get_mut(&from_id)
                .expect("still present");
            contact.ratchet.observe_their_next(next_dh);
            if let Some(version) = message.supported_version {
                contact.supported_version = version;
            }
            contact.kxs_bytes = None;
        }

        if let Some(reply_to) = message.in_reply_to {
            let now = State::now();
            if let Some(outbox) = self.state.outbox_mut(reply_to) {
                outbox.acked = Some(now);
                self.emit(ClientEvent::OutboxIndicator {
                    id: reply_to,
                    indicator: Indicator::Green,
                });
            }
        }

        for record in &message.detachments {
            // A record naming a server we cannot parse is useless to the
            // interface; skip it rather than offer a dead download.
            if let Some(url) = &record.url {
                if let Err(e) = pond_proto::url::parse_detachment(url) {
                    error!(name = %record.name, error = %e, "dropping detachment with bad URL");
                    continue;
                }
            }
            self.emit(ClientEvent::DetachmentReceived {
                inbox_id,
                from: from_id,
                record: record.clone(),
            });
        }

        Some(message)
    }
}

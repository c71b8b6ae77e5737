//! Revocation: cutting a contact out of our group, and discovering that a
//! contact has cut us out of theirs.
//!
//! Revoking rotates our group to a new generation. The old group private
//! key is retained forever so late messages still verify, and every other
//! contact's issued credential is re-derived — recording its old tag first,
//! because tags change with the credential.
//!
//! The symmetric discovery happens on send: a server answering
//! GENERATION_REVOKED attaches the signed revocation, and applying it to
//! our own member key tells us whether we survived the cut.

use tracing::{info, warn};

use pond_crypto::group::Revocation;
use pond_crypto::sign;
use pond_net::{MessageSendResult, QueuedMessage, RevocationUpdate};
use pond_proto::wire::{
    revocation_signing_bytes, Request, RevocationBundle, SignedRevocation,
};

use crate::client::Client;
use crate::error::ClientError;
use crate::events::{ClientEvent, Indicator};
use crate::state::{OutboxMessage, PreviousGroupPrivateKey, State};

impl Client {
    /// Revokes `to`: no delivery will ever be queued to them again, and
    /// every server in our contact graph learns the new generation the next
    /// time we deliver. A signed revocation notice is queued to the revoked
    /// contact's own server under our real identity.
    pub fn revoke(&mut self, to: u64) -> Result<(), ClientError> {
        let now = State::now();

        let revocation = {
            let contact = self.state.contact(to)?;
            self.state.group_priv.generate_revocation(&contact.issued_key)?
        };
        let (server, created) = {
            let contact = self.state.contact_mut(to)?;
            contact.revoked = true;
            (contact.their_server.clone(), now)
        };

        // Keep the pre-rotation private key; in-flight messages were signed
        // under it.
        self.state.previous_group_privs.push(PreviousGroupPrivateKey {
            key: self.state.group_priv.clone(),
            expired: now,
        });

        for contact in self.state.contacts.values_mut() {
            if contact.id == to {
                continue;
            }
            contact.previous_tags.push(crate::contact::PreviousTag {
                tag: contact.issued_key.tag(),
                expired: now,
            });
            let updated = contact.issued_key.update(&revocation);
            assert!(updated, "member key update failed for an unrevoked contact");
        }

        // The wire carries the generation being ended; recipients compare
        // it against the generation they knew and then advance.
        let bundle = RevocationBundle {
            revocation: revocation.to_bytes(),
            generation: self.state.generation,
        };
        self.state.group_priv.update(&revocation);
        self.state.generation += 1;

        let signed = revocation_signing_bytes(&bundle);
        let signature = sign::sign(&self.state.identity.signing, &signed).to_vec();
        let signed_revocation = SignedRevocation {
            revocation: bundle,
            signature,
        };

        let id = self.rng().random_id();
        self.queue().enqueue(QueuedMessage {
            id,
            to,
            server: server.clone(),
            revocation: true,
            request: Request::Revocation(signed_revocation),
            created,
        });
        self.state.outbox.push(OutboxMessage {
            id,
            to,
            server,
            created,
            sent: None,
            acked: None,
            revocation: true,
            message: None,
            undeliverable: false,
        });
        self.emit(ClientEvent::OutboxAdded {
            id,
            to,
            indicator: Indicator::Red,
        });
        self.save();
        Ok(())
    }

    /// Handles the worker's report for one send transaction: either a plain
    /// acceptance, or a GENERATION_REVOKED bounce carrying the sender's
    /// signed revocation.
    pub fn process_send_result(&mut self, result: MessageSendResult) {
        let Some(outbox_index) = self.state.outbox.iter().position(|m| m.id == result.id) else {
            return;
        };
        let to = self.state.outbox[outbox_index].to;

        if let Some(signed) = result.revocation {
            self.process_peer_revocation(to, signed);
            return;
        }

        let entry = &mut self.state.outbox[outbox_index];
        entry.sent = Some(State::now());
        let indicator = if entry.revocation {
            Indicator::Green
        } else {
            Indicator::Yellow
        };
        self.emit(ClientEvent::OutboxIndicator {
            id: result.id,
            indicator,
        });
        self.save();
    }

    /// A contact's server told us their group moved on. Verify the notice,
    /// advance our record of their generation, and either refresh our
    /// credential (someone else was cut) or accept that we were.
    fn process_peer_revocation(&mut self, to: u64, signed: SignedRevocation) {
        enum Outcome {
            RevokedUs,
            Refreshed(RevocationUpdate),
        }

        let outcome = {
            let Ok(contact) = self.state.contact_mut(to) else {
                return;
            };

            if signed.revocation.generation != contact.generation {
                info!(
                    contact = %contact.name,
                    wire = signed.revocation.generation,
                    known = contact.generation,
                    "revocation for a generation that is not current"
                );
                return;
            }

            let Ok(verifying) = sign::verifying_key(&contact.their_signing_public) else {
                warn!(contact = %contact.name, "contact has no usable signing key");
                return;
            };
            let message = revocation_signing_bytes(&signed.revocation);
            if let Err(e) = sign::verify(&verifying, &message, &signed.signature) {
                warn!(contact = %contact.name, error = %e, "bad signature on revocation");
                return;
            }
            let Ok(revocation) = Revocation::from_bytes(&signed.revocation.revocation) else {
                warn!(contact = %contact.name, "failed to parse revocation");
                return;
            };

            contact.generation += 1;
            let Some(my_key) = contact.my_group_key.as_mut() else {
                return;
            };
            if my_key.update(&revocation) {
                // Someone else fell; our refreshed credential must re-sign
                // everything still queued to this contact. The worker signs
                // under its own duplicate of the key.
                Outcome::Refreshed(RevocationUpdate {
                    to,
                    key: my_key.clone(),
                    generation: contact.generation,
                })
            } else {
                info!(contact = %contact.name, "revoked by contact");
                contact.revoked_us = true;
                Outcome::RevokedUs
            }
        };

        match outcome {
            Outcome::RevokedUs => {
                self.emit(ClientEvent::ContactRevokedUs { id: to });
                // Atomic with the flag above from the worker's perspective:
                // the queue mutex covers the whole drain.
                let dropped = self.queue().remove_contact(to);
                for id in dropped {
                    if let Some(outbox) = self.state.outbox_mut(id) {
                        outbox.undeliverable = true;
                    }
                    self.emit(ClientEvent::OutboxIndicator {
                        id,
                        indicator: Indicator::Black,
                    });
                }
            }
            Outcome::Refreshed(update) => {
                let _ = self.revocation_tx.send(update);
            }
        }
        self.emit(ClientEvent::RevocationProcessed);
        self.save();
    }
}

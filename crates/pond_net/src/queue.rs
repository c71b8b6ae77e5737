//! The outbound queue shared between the state owner and the network worker.
//!
//! The state owner enqueues and drains; the worker rotates the head and
//! re-signs entries after a revocation. One mutex covers every operation,
//! and each critical section is short and bounded.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use pond_crypto::{sha256, SecureRng};
use pond_proto::wire::Request;

use crate::events::RevocationUpdate;

/// One pending delivery or revocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: u64,
    /// Recipient contact id.
    pub to: u64,
    /// Server URL the request goes to.
    pub server: String,
    /// Revocations use the real identity on the wire and a different
    /// done-indicator in the outbox.
    pub revocation: bool,
    pub request: Request,
    /// Seconds since the epoch.
    pub created: i64,
}

#[derive(Clone, Default)]
pub struct SharedQueue {
    inner: Arc<Mutex<Vec<QueuedMessage>>>,
}

impl SharedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message. Two entries with the same id would break head
    /// rotation and ack matching, so a duplicate is a programmer error.
    pub fn enqueue(&self, message: QueuedMessage) {
        let mut queue = self.inner.lock();
        assert!(
            queue.iter().all(|m| m.id != message.id),
            "duplicate outbox id {}",
            message.id
        );
        queue.push(message);
    }

    /// Takes the head for transmission and rotates it to the tail, so one
    /// persistently failing message cannot starve the rest. Returns a copy;
    /// the entry itself stays queued until [`SharedQueue::remove`].
    pub fn rotate_head(&self) -> Option<QueuedMessage> {
        let mut queue = self.inner.lock();
        if queue.is_empty() {
            return None;
        }
        let head = queue.remove(0);
        queue.push(head.clone());
        Some(head)
    }

    /// Removes a message after the server accepted it.
    pub fn remove(&self, id: u64) {
        self.inner.lock().retain(|m| m.id != id);
    }

    /// Drops every pending message to a contact that revoked us. Returns
    /// the dropped ids so the outbox can mark them undeliverable. The
    /// removal is atomic with respect to worker head rotation.
    pub fn remove_contact(&self, to: u64) -> Vec<u64> {
        let mut queue = self.inner.lock();
        let dropped = queue
            .iter()
            .filter(|m| m.to == to)
            .map(|m| m.id)
            .collect();
        queue.retain(|m| m.to != to);
        dropped
    }

    /// Re-signs every queued delivery to a contact with their refreshed
    /// member key. Runs only on the network worker, with the lock held for
    /// the whole scan, so rotation never observes a half-updated entry.
    pub fn resign(&self, update: &RevocationUpdate, rng: &SecureRng) {
        let mut queue = self.inner.lock();
        for entry in queue.iter_mut() {
            if entry.to != update.to {
                continue;
            }
            if let Request::Deliver {
                signature,
                generation,
                message,
                ..
            } = &mut entry.request
            {
                let digest = sha256(message);
                *signature = update.key.sign(&digest, rng).to_bytes();
                *generation = update.generation;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Snapshot for persistence and tests.
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pond_crypto::group::GroupPrivateKey;

    fn entry(id: u64, to: u64) -> QueuedMessage {
        QueuedMessage {
            id,
            to,
            server: "pondserver://x@localhost".into(),
            revocation: false,
            request: Request::Fetch,
            created: 0,
        }
    }

    #[test]
    fn head_rotation_cycles_without_losing_entries() {
        let queue = SharedQueue::new();
        queue.enqueue(entry(1, 10));
        queue.enqueue(entry(2, 11));
        queue.enqueue(entry(3, 12));

        assert_eq!(queue.rotate_head().unwrap().id, 1);
        assert_eq!(queue.rotate_head().unwrap().id, 2);
        assert_eq!(queue.rotate_head().unwrap().id, 3);
        assert_eq!(queue.rotate_head().unwrap().id, 1);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    #[should_panic(expected = "duplicate outbox id")]
    fn duplicate_id_panics() {
        let queue = SharedQueue::new();
        queue.enqueue(entry(1, 10));
        queue.enqueue(entry(1, 11));
    }

    #[test]
    fn remove_contact_reports_dropped_ids() {
        let queue = SharedQueue::new();
        queue.enqueue(entry(1, 10));
        queue.enqueue(entry(2, 20));
        queue.enqueue(entry(3, 10));

        let dropped = queue.remove_contact(10);
        assert_eq!(dropped, vec![1, 3]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.snapshot()[0].id, 2);
    }

    #[test]
    fn resign_updates_signature_and_generation() {
        let rng = SecureRng::from_seed([50; 32]);
        let owner = GroupPrivateKey::generate(&rng);
        let member = owner.new_member(&rng);

        let message = vec![0x77; 64];
        let digest = sha256(&message);
        let queue = SharedQueue::new();
        queue.enqueue(QueuedMessage {
            id: 1,
            to: 10,
            server: "pondserver://x@localhost".into(),
            revocation: false,
            request: Request::Deliver {
                to: [0; 32],
                signature: member.sign(&digest, &rng).to_bytes(),
                generation: 0,
                message,
            },
            created: 0,
        });

        let update = RevocationUpdate {
            to: 10,
            key: member.clone(),
            generation: 1,
        };
        queue.resign(&update, &rng);
        queue.resign(&update, &rng); // idempotent: still verifies

        let snapshot = queue.snapshot();
        match &snapshot[0].request {
            Request::Deliver {
                signature,
                generation,
                message,
                ..
            } => {
                assert_eq!(*generation, 1);
                let sig =
                    pond_crypto::group::GroupSignature::from_bytes(signature).unwrap();
                assert!(owner.group().verify(&sha256(message), &sig));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }
}

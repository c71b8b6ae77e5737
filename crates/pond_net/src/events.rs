//! Typed messages between the network worker and the state owner.
//!
//! All cross-task communication goes over bounded channels carrying these
//! types; the queue mutex is the only shared mutable state.

use tokio::sync::oneshot;

use pond_crypto::group::MemberKey;
use pond_proto::wire::{Announce, Fetched, SignedRevocation};

/// A fetched envelope or a server announcement. The worker blocks on `ack`
/// until the state owner has fully processed the message, which keeps
/// deliveries in wire order.
pub struct NewMessage {
    pub fetched: Option<Fetched>,
    pub announce: Option<Announce>,
    pub ack: oneshot::Sender<()>,
}

/// Outcome of a send transaction. `revocation` is set when the server
/// answered GENERATION_REVOKED; the queue entry is left in place and the
/// revocation handler decides its fate.
#[derive(Debug)]
pub struct MessageSendResult {
    pub id: u64,
    pub revocation: Option<SignedRevocation>,
}

/// A contact's member key was refreshed after a third-party revocation;
/// every queued delivery to them must be re-signed. The key is a duplicate
/// made by the state owner, so the worker signs under a stable copy while
/// the live contact moves on.
pub struct RevocationUpdate {
    pub to: u64,
    pub key: MemberKey,
    pub generation: u32,
}

/// Throttled progress report from a background detachment transfer.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub id: u64,
    pub done: u64,
    pub total: u64,
    pub status: String,
}

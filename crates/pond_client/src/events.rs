//! Events delivered to the interface layer.

use pond_net::TransferProgress;
use pond_proto::wire::DetachmentRecord;

/// Status dot next to an inbox/outbox/contact entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    /// Created, nothing confirmed yet.
    Red,
    /// Accepted by the server, awaiting a reply from the recipient.
    Yellow,
    /// Done: delivered revocation, or acked message.
    Green,
    /// New inbound message.
    Blue,
    /// Dead: undeliverable, or contact revoked us.
    Black,
}

#[derive(Debug)]
pub enum ClientEvent {
    InboxAdded {
        id: u64,
        from: u64,
        indicator: Indicator,
    },
    OutboxAdded {
        id: u64,
        to: u64,
        indicator: Indicator,
    },
    OutboxIndicator {
        id: u64,
        indicator: Indicator,
    },
    ContactRevokedUs {
        id: u64,
    },
    /// A decoded message carried this detachment; the interface offers
    /// download-and-decrypt when a URL is present, decrypt-only otherwise.
    DetachmentReceived {
        inbox_id: u64,
        from: u64,
        record: DetachmentRecord,
    },
    RevocationProcessed,
    Transfer(TransferProgress),
}

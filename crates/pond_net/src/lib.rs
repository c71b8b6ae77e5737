//! pond_net — transport, transaction engine, and bulk transfers
//!
//! # Modules
//! - `session`  — authenticated framed connection to a server
//! - `dial`     — SOCKS5 dialing, connection isolation, account creation
//! - `worker`   — the single network transaction task
//! - `queue`    — the outbound queue shared with the state owner
//! - `events`   — typed messages exchanged with the state owner
//! - `transfer` — resumable detachment uploads and downloads
//! - `error`    — unified error type

pub mod dial;
pub mod error;
pub mod events;
pub mod queue;
pub mod session;
pub mod transfer;
pub mod worker;

#[cfg(test)]
mod testserver;

pub use dial::{DialConfig, DEFAULT_SOCKS_ADDR};
pub use error::NetError;
pub use events::{MessageSendResult, NewMessage, RevocationUpdate, TransferProgress};
pub use queue::{QueuedMessage, SharedQueue};
pub use worker::{NetworkWorker, WorkerConfig};

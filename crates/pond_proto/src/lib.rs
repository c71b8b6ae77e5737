//! pond_proto — wire types and encodings for the Pond client
//!
//! # Modules
//! - `wire`  — Request/Reply unions, the plaintext `Message`, revocations
//! - `codec` — fixed-size payload padding
//! - `url`   — `pondserver` server and detachment URLs
//! - `error` — unified error type

pub mod codec;
pub mod error;
pub mod url;
pub mod wire;

pub use error::ProtoError;
pub use wire::{Message, Reply, Request, SignedRevocation, Status};

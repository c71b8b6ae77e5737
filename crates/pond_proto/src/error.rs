use thiserror::Error;

use crate::wire::Status;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Message too large")]
    MessageTooLarge,

    #[error("Invalid padding: {0}")]
    InvalidPadding(&'static str),

    #[error("Error from server: {0:?}")]
    ServerStatus(Status),

    #[error("Bad server URL: {0}")]
    BadUrl(String),

    #[error("Bad detachment URL: {0}")]
    BadDetachmentUrl(String),

    #[error("Wire encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

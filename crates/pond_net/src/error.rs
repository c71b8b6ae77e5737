use thiserror::Error;

use pond_proto::ProtoError;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Read deadline exceeded")]
    Timeout,

    #[error("Peer closed the connection")]
    Closed,

    #[error("Handshake failed: {0}")]
    Handshake(&'static str),

    #[error("Bad frame: {0}")]
    Frame(&'static str),

    #[error("SOCKS proxy error: {0}")]
    Socks(#[from] tokio_socks::Error),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("Transfer canceled")]
    Canceled,

    #[error("Transfer failed: {0}")]
    Transfer(&'static str),
}

impl NetError {
    /// The cancellation sentinel must never be confused with a real failure
    /// or written to durable state.
    pub fn is_canceled(&self) -> bool {
        matches!(self, NetError::Canceled)
    }
}

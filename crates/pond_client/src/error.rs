use thiserror::Error;

use pond_crypto::CryptoError;
use pond_proto::ProtoError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("No such contact")]
    NoSuchContact,

    #[error("A contact with that name already exists")]
    DuplicateName,

    #[error("Key exchange with this contact is still pending")]
    ContactPending,

    #[error("Key exchange already complete")]
    AlreadyActive,

    #[error("This contact has been revoked")]
    ContactRevoked,

    #[error("This contact has revoked us")]
    ContactRevokedUs,

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Net(#[from] pond_net::NetError),

    #[error("The network worker has shut down")]
    WorkerShutdown,
}

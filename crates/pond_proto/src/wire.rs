//! Request/Reply wire unions.
//!
//! Every connection carries exactly one request and one reply, both
//! bincode-encoded inside the transport's encrypted frames. `Request` is a
//! closed union; `Reply` carries a status plus the section matching the
//! request kind. Anything the recipient does not expect is ignored.

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// One client request per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Registers this identity with its home server.
    NewAccount {
        generation: u32,
        /// Marshaled group public key, handed out to contacts on key exchange.
        group: Vec<u8>,
    },
    /// Drops an anonymously-signed message into a recipient's mailbox.
    Deliver {
        to: [u8; 32],
        /// Marshaled group signature over SHA-256 of `message`.
        signature: Vec<u8>,
        generation: u32,
        message: Vec<u8>,
    },
    /// Picks up at most one queued message from our own mailbox.
    Fetch,
    /// Tells a contact's server that a member of our group was revoked.
    Revocation(SignedRevocation),
    /// Starts or resumes a detachment upload.
    Upload { id: u64, size: u64 },
    /// Starts or resumes a detachment download.
    Download {
        from: [u8; 32],
        id: u64,
        resume: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    ParseError,
    NoAccount,
    InternalError,
    DeliverySignatureInvalid,
    IncorrectGeneration,
    MailboxFull,
    NoSuchDelivery,
    OverQuota,
    FileLargerThanSize,
    FileComplete,
    ResumePastEndOfFile,
    GenerationRevoked,
    CannotParseRevocation,
}

/// One server reply per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    pub fetched: Option<Fetched>,
    pub announce: Option<Announce>,
    pub upload: Option<UploadReply>,
    pub download: Option<DownloadReply>,
    pub revocation: Option<SignedRevocation>,
}

impl Reply {
    pub fn ok() -> Self {
        Self::with_status(Status::Ok)
    }

    pub fn with_status(status: Status) -> Self {
        Reply {
            status,
            fetched: None,
            announce: None,
            upload: None,
            download: None,
            revocation: None,
        }
    }
}

/// A message pulled from our mailbox: still sealed, with the sender's
/// anonymous group signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fetched {
    pub signature: Vec<u8>,
    pub message: Vec<u8>,
}

/// A plaintext notice from the home server itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    pub message: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReply {
    /// Byte offset the server already holds; upload continues from here.
    pub resume: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadReply {
    /// Total size of the file held by the server.
    pub size: u64,
}

/// The plaintext payload inside a sealed envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    /// Sender wall clock, seconds since the epoch.
    pub time: i64,
    pub body: Vec<u8>,
    /// The DH public value we should seal to next. Must be 32 bytes.
    pub my_next_dh: Vec<u8>,
    /// Acks the outbox entry with this id.
    pub in_reply_to: Option<u64>,
    /// Highest envelope version the sender accepts.
    pub supported_version: Option<u32>,
    pub detachments: Vec<DetachmentRecord>,
}

/// A bulk encrypted file delivered outside the fixed-size envelope. The
/// at-rest key always travels inline; the ciphertext either sits on a
/// server (`url` set, recipient downloads then decrypts) or reaches the
/// recipient out of band (`url` absent, recipient only decrypts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetachmentRecord {
    pub name: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// At-rest encryption key for the detached ciphertext.
    pub key: Vec<u8>,
    pub url: Option<String>,
}

/// A group revocation plus the generation it produced, signed by the
/// revoker's identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRevocation {
    pub revocation: RevocationBundle,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevocationBundle {
    /// Marshaled group revocation token.
    pub revocation: Vec<u8>,
    pub generation: u32,
}

/// Domain separation for revocation signatures.
pub const REVOCATION_SIGNATURE_PREFIX: &[u8] = b"revocation\0";

/// The exact bytes an identity key signs for a revocation: the constant
/// prefix followed by the encoded bundle.
pub fn revocation_signing_bytes(bundle: &RevocationBundle) -> Vec<u8> {
    let mut signed = REVOCATION_SIGNATURE_PREFIX.to_vec();
    signed.extend_from_slice(&encode(bundle));
    signed
}

/// Maps a reply status to an error, `Ok` for `Status::Ok`.
pub fn reply_to_error(reply: &Reply) -> Result<(), ProtoError> {
    match reply.status {
        Status::Ok => Ok(()),
        status => Err(ProtoError::ServerStatus(status)),
    }
}

pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("wire types serialize without failure")
}

pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, ProtoError> {
    Ok(bincode::deserialize(bytes)?)
}

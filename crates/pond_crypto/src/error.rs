use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    SignatureVerification,

    #[error("Bad signature length: {0} bytes")]
    SignatureLength(usize),

    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed")]
    AeadDecrypt,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Group element failed to decode")]
    GroupDecode,

    #[error("Degenerate group parameter")]
    DegenerateGroup,

    #[error("Member has been revoked")]
    Revoked,
}

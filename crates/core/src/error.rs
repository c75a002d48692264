use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Truncated buffer: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Message expired")]
    Expired,

    #[error("Message expiration too far in the future")]
    FromFuture,

    #[error("Unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl From<bincode::Error> for CoreError {
    fn from(e: bincode::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

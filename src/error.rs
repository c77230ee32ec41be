use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmberError {
    #[error(
        "Invalid key size: key must be 1-{} bytes",
        crate::constants::MAX_KEY_SIZE
    )]
    InvalidKeySize,

    #[error(
        "Invalid value size: value must be at most {} bytes",
        crate::constants::MAX_VALUE_SIZE
    )]
    InvalidValueSize,

    #[error("Key not found")]
    KeyNotFound,

    #[error("Key exists")]
    KeyExists,

    #[error("Not my vbucket")]
    NotMyVbucket,

    #[error("Temporary failure")]
    TempFail,

    #[error("Out of memory")]
    NoMemory,

    #[error("Operation would block")]
    WouldBlock,

    #[error("Resource is locked")]
    Locked,

    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Not supported")]
    NotSupported,

    #[error("Rollback required to seqno {0}")]
    Rollback(u64),

    #[error("Vbucket state record is corrupted: {0}")]
    Corrupted(String),

    #[error("System shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("State serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EmberError>;

impl EmberError {
    /// Whether the client should retry the operation later without changes.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EmberError::TempFail | EmberError::WouldBlock | EmberError::NoMemory
        )
    }
}

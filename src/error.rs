use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No such key: {0}")]
    NoSuchKey(String),

    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    #[error("Concurrent update on key: {0}")]
    ConcurrentUpdate(String),

    #[error("Invalid dependent versions: {0}")]
    InvalidDependents(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// Error conversions for the wire codec

impl From<bincode::error::EncodeError> for StoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

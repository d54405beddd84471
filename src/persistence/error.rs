//! Session store error types

use std::fmt;

/// Errors raised by the durable session store
#[derive(Debug)]
pub enum StoreError {
    /// Underlying keyspace error
    Storage(fjall::Error),
    /// Serialization failed
    Encode(bincode::error::EncodeError),
    /// Stored blob failed to parse
    Decode(bincode::error::DecodeError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Storage(e) => write!(f, "storage error: {}", e),
            StoreError::Encode(e) => write!(f, "encode error: {}", e),
            StoreError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<fjall::Error> for StoreError {
    fn from(e: fjall::Error) -> Self {
        StoreError::Storage(e)
    }
}

impl From<bincode::error::EncodeError> for StoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        StoreError::Encode(e)
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        StoreError::Decode(e)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

//! Error types for s3pipe core

use thiserror::Error;

/// Errors returned by an [`ObjectStore`](crate::store::ObjectStore)
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Unexpected response: {0}")]
    Protocol(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl StoreError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Network(_) | StoreError::Timeout => true,
            StoreError::ServerError { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}

/// Errors that terminate a transfer
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Failed to read source: {0}")]
    SourceRead(#[source] std::io::Error),

    #[error("Failed to write output: {0}")]
    OutputWrite(#[source] std::io::Error),

    #[error("Part {sequence} failed after {attempts} attempt(s): {source}")]
    PartFailed {
        sequence: u64,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("No checksum available at {bucket}/{key}")]
    ChecksumMissing { bucket: String, key: String },

    #[error("Checksum mismatch: expected {expected}, computed {actual}; local output is invalid")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Checksum record at {bucket}/{key} is not a valid MD5 digest")]
    InvalidChecksumRecord { bucket: String, key: String },

    #[error("Stream needs more than {max_parts} parts")]
    PartLimitExceeded { max_parts: u32 },

    #[error("Transfer deadline exceeded")]
    DeadlineExceeded,

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransferError {
    /// The local output exists but must not be trusted
    pub fn output_invalid(&self) -> bool {
        matches!(self, TransferError::ChecksumMismatch { .. })
    }
}

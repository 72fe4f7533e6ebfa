//! Error types for the stripe storage engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the stripe storage engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Archive Format Errors
    // =========================================================================
    /// An archive record failed constant-field validation or its sizes are
    /// inconsistent. Fatal to that one record; never silently repaired.
    #[error("archive format violation in {record}: {reason}")]
    Format { record: &'static str, reason: String },

    /// Payload checksum did not match the checksum recorded in the archive
    #[error("checksum mismatch for {name}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    // =========================================================================
    // Endpoint Errors
    // =========================================================================
    /// Open/read/write/stat failure against one endpoint
    #[error("endpoint {url} failed: {reason}")]
    Endpoint { url: String, reason: String },

    /// An endpoint operation did not complete within the configured timeout
    #[error("endpoint {url} timed out after {seconds}s")]
    Timeout { url: String, seconds: u64 },

    /// An archive entry expected by the central directory is absent
    #[error("stripe {name} not found")]
    StripeNotFound { name: String },

    // =========================================================================
    // Erasure Coding Errors
    // =========================================================================
    /// Insufficient stripes for reconstruction
    #[error("insufficient stripes for reconstruction: have {available}, need {required}")]
    InsufficientStripes { available: usize, required: usize },

    /// Fewer than `data_chunks` healthy stripes survive for a block.
    /// Recorded per block; processing continues for the other blocks.
    #[error("block {block} unrecoverable: {healthy} healthy stripes, {required} required")]
    UnrecoverableBlock {
        block: u64,
        healthy: usize,
        required: usize,
    },

    /// Invalid object layout configuration
    #[error("invalid object configuration: {0}")]
    Config(String),

    /// Replacement endpoint list exhausted while redirecting
    #[error("no replacement endpoint left for {url}")]
    ReplacementExhausted { url: String },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for an endpoint failure with a formatted reason.
    pub fn endpoint(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Endpoint {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a record format violation.
    pub fn format(record: &'static str, reason: impl Into<String>) -> Self {
        Error::Format {
            record,
            reason: reason.into(),
        }
    }
}

//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// The data source failed to produce a value
    #[error("Fetching {key} failed: {message}")]
    #[diagnostic(
        code(pipedash::cache::fetch),
        help("The last-known value, if any, is still served until a fetch succeeds")
    )]
    Fetch {
        /// The cache key being read
        key: String,
        /// Error message from the data source
        message: String,
    },

    /// The read was cancelled before the data source answered
    #[error("Read of {key} was cancelled")]
    #[diagnostic(code(pipedash::cache::cancelled))]
    Cancelled {
        /// The cache key being read
        key: String,
    },

    /// A cached value could not be decoded into the requested type
    #[error("Cached value for {key} has an unexpected shape: {message}")]
    #[diagnostic(code(pipedash::cache::decode))]
    Decode {
        /// The cache key being decoded
        key: String,
        /// Error message from the decoder
        message: String,
    },
}

impl Error {
    /// Create a fetch error
    #[must_use]
    pub fn fetch(key: impl ToString, message: impl Into<String>) -> Self {
        Self::Fetch {
            key: key.to_string(),
            message: message.into(),
        }
    }

    /// Create a cancellation error
    #[must_use]
    pub fn cancelled(key: impl ToString) -> Self {
        Self::Cancelled {
            key: key.to_string(),
        }
    }

    /// Create a decode error
    #[must_use]
    pub fn decode(key: impl ToString, message: impl Into<String>) -> Self {
        Self::Decode {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

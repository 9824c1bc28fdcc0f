//! Error types for the sync engine
//!
//! Event handling itself never fails; these cover configuration and lifecycle
//! misuse only.

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for sync engine operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Invalid configuration value
    #[error("Sync configuration error: {message}")]
    #[diagnostic(code(pipedash::sync::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Reading a configuration file failed
    #[error("Failed to read {}", path.display())]
    #[diagnostic(
        code(pipedash::sync::io),
        help("Check that the file exists and is readable")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error
        path: Box<Path>,
    },

    /// `start` was called on a running engine
    #[error("Sync engine is already running")]
    #[diagnostic(code(pipedash::sync::already_started))]
    AlreadyStarted,

    /// `start` was called after `stop`
    #[error("Sync engine has been stopped")]
    #[diagnostic(
        code(pipedash::sync::stopped),
        help("An engine is single-use; construct a new one when the owning context remounts")
    )]
    Stopped,
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(source: std::io::Error, path: impl AsRef<Path>) -> Self {
        Self::Io {
            source,
            path: path.as_ref().into(),
        }
    }
}

/// Result type for sync engine operations
pub type Result<T> = std::result::Result<T, Error>;

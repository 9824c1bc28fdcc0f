//! Error types for the event channel

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Error type for event channel operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// The channel has been shut down
    #[error("event channel is closed")]
    #[diagnostic(
        code(pipedash::events::closed),
        help("The owning context shut the channel down; construct a new one")
    )]
    Closed,

    /// Registering a handler failed
    #[error("Failed to subscribe to '{event_type}': {message}")]
    #[diagnostic(code(pipedash::events::subscribe))]
    SubscribeFailed {
        /// Event type the subscription was requested for
        event_type: String,
        /// Transport-specific failure description
        message: String,
    },

    /// A wire message could not be decoded
    #[error("Failed to decode wire message: {message}")]
    #[diagnostic(
        code(pipedash::events::decode),
        help("Expected {{\"event\": .., \"payload\": ..}} or {{\"status\": .., \"reconnectAttempts\": ..}}")
    )]
    Decode {
        /// Decoder error message
        message: String,
    },

    /// Reading from the underlying stream failed
    #[error("I/O error while reading the event stream")]
    #[diagnostic(code(pipedash::events::io))]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a subscription failure
    #[must_use]
    pub fn subscribe_failed(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SubscribeFailed {
            event_type: event_type.into(),
            message: message.into(),
        }
    }

    /// Create a decode error
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source }
    }
}

/// Result type for event channel operations
pub type Result<T> = std::result::Result<T, Error>;

//! Error types and result handling for pg-walsub.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Errors fall into two groups. Fatal errors ([`Error::is_fatal`]) end a
//! replication session; everything else is reported on the session's
//! notification channel while the stream keeps running.
//!
//! # Example
//!
//! ```rust
//! use pg_walsub::{Error, Result};
//!
//! fn read_frame() -> Result<()> {
//!     Err(Error::Frame("truncated keepalive".to_string()))
//! }
//!
//! match read_frame() {
//!     Ok(()) => println!("Frame read"),
//!     Err(e) if e.is_fatal() => eprintln!("Session is gone: {}", e),
//!     Err(e) => eprintln!("Skipping frame: {}", e),
//! }
//! ```

use thiserror::Error;

use crate::lsn::Lsn;

/// The main error type for pg-walsub operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from an invalid config file or
    /// environment override.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Connection-level failure: the socket closed, the server ended the
    /// copy stream, or a send could not be completed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O error on the underlying socket.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The server answered a command with an ErrorResponse.
    #[error("Server error: {0}")]
    Server(String),

    /// Authentication failure with PostgreSQL.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Malformed replication framing (unknown tag or truncated payload).
    #[error("Frame error: {0}")]
    Frame(String),

    /// A change payload could not be decoded by the output decoder.
    #[error("Decode error: {message}{}", .position.map(|p| format!(" at byte {}", p)).unwrap_or_default())]
    Decode {
        /// Description of what could not be decoded
        message: String,
        /// Byte offset into the payload where decoding failed, if known
        position: Option<usize>,
    },

    /// A tuple referenced a relation id that no Relation message defined.
    #[error("Unknown relation ID: {0}")]
    UnknownRelation(u32),

    /// Sending a standby status update failed.
    #[error("Acknowledgment error: {0}")]
    Acknowledgment(String),

    /// Text that does not parse as an `X/Y` log sequence number.
    #[error("Invalid LSN: {0}")]
    InvalidLsn(String),

    /// An operation was attempted in the wrong session state.
    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        /// State the operation requires
        expected: &'static str,
        /// State the session was actually in
        actual: String,
    },

    /// JSON serialization error when rendering change events.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a [`Error::Decode`] without a known position.
    pub fn decode(message: impl Into<String>) -> Self {
        Error::Decode {
            message: message.into(),
            position: None,
        }
    }

    /// Shorthand for a [`Error::Decode`] at a byte offset.
    pub fn decode_at(message: impl Into<String>, position: usize) -> Self {
        Error::Decode {
            message: message.into(),
            position: Some(position),
        }
    }

    /// Reports a failed status update that the session recovers from.
    ///
    /// Sends triggered by the scheduler or by a keepalive are published on
    /// the event channel, where a [`Error::Transport`] would read as fatal.
    pub fn acknowledgment_failed(lsn: Lsn, source: Error) -> Self {
        match source {
            Error::Acknowledgment(_) => source,
            other => Error::Acknowledgment(format!("status update at {} failed: {}", lsn, other)),
        }
    }

    /// Whether this error terminates a replication session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Io(_) | Error::Server(_) | Error::Authentication(_)
        )
    }
}

/// A convenient Result type alias for pg-walsub operations.
///
/// This is equivalent to `std::result::Result<T, pg_walsub::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

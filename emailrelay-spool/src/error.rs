//! Error types for the emailrelay-spool crate.
//!
//! Store errors are split by who has to deal with them: a bad spool directory is
//! fatal at startup, a write failure is reported back to the submitting client as
//! a transient error, and a damaged envelope only ever affects its own message.

use std::io;

use thiserror::Error;

use crate::MessageId;

/// Top-level spool error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The spool directory is missing, not a directory, or not writable.
    #[error("Invalid spool directory {path}: {reason}")]
    InvalidDirectory { path: String, reason: String },

    /// Writing or committing a new message failed; nothing was left behind.
    #[error("Failed to store message {id}: {source}")]
    Write {
        id: MessageId,
        #[source]
        source: io::Error,
    },

    /// No envelope exists for the id in any state.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// Somebody else holds the lock.
    #[error("Message {0} is locked")]
    Locked(MessageId),

    /// The envelope could not be used; the message has been moved aside.
    #[error("Message {id} failed: {source}")]
    Envelope {
        id: MessageId,
        #[source]
        source: EnvelopeError,
    },

    /// I/O operation failed (directory scan, rename, delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    /// Returns `true` if retrying the same operation later might succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Write { .. } | Self::Io(_))
    }
}

/// Reasons an envelope file cannot be used.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Unknown format version or an unexpected line.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// The file ended before the end marker, typically a crash mid-write.
    #[error("no end marker")]
    NoEnd,

    /// A required field was not where it should be.
    #[error("missing field {0}")]
    MissingField(&'static str),

    /// A line where a recipient was expected was not `To-Local` or `To-Remote`.
    #[error("invalid recipient line: {0}")]
    InvalidRecipientLine(String),

    #[error("invalid recipient count: {0}")]
    InvalidCount(String),

    /// Nothing left to forward.
    #[error("no remote recipients")]
    NoRemoteRecipients,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let store_err: StoreError = io_err.into();
        assert!(matches!(store_err, StoreError::Io(_)));
        assert!(store_err.is_transient());
    }

    #[test]
    fn test_envelope_error_display() {
        let err = StoreError::Envelope {
            id: MessageId::new(1, 2, 3),
            source: EnvelopeError::NoEnd,
        };
        assert_eq!(err.to_string(), "Message emailrelay.1.2.3 failed: no end marker");
        assert!(!err.is_transient());
    }
}

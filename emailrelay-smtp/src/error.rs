//! Error types for the emailrelay-smtp crate.
//!
//! Protocol-level outcomes are plain values ([`Failure`]); only the reactor
//! adapters deal in errors proper.

use std::{io, time::Duration};

use thiserror::Error;

/// How far a failed delivery attempt reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The message could not be stored locally; worth retrying.
    Local,
    /// The peer refused this message; the connection is still usable.
    Message,
    /// The connection itself is unusable for further messages.
    Connection,
}

/// Why a message was not accepted or not forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct Failure {
    pub reason: String,
    pub scope: Scope,
}

impl Failure {
    pub fn local(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            scope: Scope::Local,
        }
    }

    pub fn message(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            scope: Scope::Message,
        }
    }

    pub fn connection(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            scope: Scope::Connection,
        }
    }
}

/// Errors ending an inbound session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The client went quiet for longer than allowed.
    #[error("Timed out after {0:?} waiting for the client")]
    Timeout(Duration),

    /// The session ran past the connection time limit.
    #[error("Connection exceeded {0:?}")]
    ConnectionTimeout(Duration),
}

/// Why an outbound batch stopped early.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Unable to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("Timed out waiting for a response")]
    ResponseTimeout,

    #[error("Connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A failure that makes the connection useless, such as a narrow pipe.
    #[error("{0}")]
    Protocol(Failure),
}

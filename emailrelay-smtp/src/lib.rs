//! SMTP for a store-and-forward relay.
//!
//! Both directions are written as sans-I/O state machines: they are fed one
//! line at a time and write through a [`Sender`]. The [`server::session`] and
//! [`client::session`] modules drive them over tokio sockets.

pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod sender;
pub mod server;
pub mod state;
pub mod verifier;

pub use client::{BatchEvent, Client, ClientEvent, ClientProtocol, NextHop, Outgoing, Summary};
pub use command::{Command, HeloVariant, MailParameters};
pub use config::{ForwardMode, ServerConfig};
pub use connection::{COMMAND_LINE_LIMIT, Line, LineBuffer, SocketSender};
pub use error::{Failure, ForwardError, Scope, SessionError};
pub use message::{Processing, ProtocolMessage, ProtocolMessageForward, ProtocolMessageStore};
pub use sender::{Outbox, Sender};
pub use server::{CONTENT_LINE_LIMIT, ServerContext, ServerEvent, ServerProtocol};
pub use state::State;
pub use verifier::{ExternalVerifier, InternalVerifier, Verification, Verifier};

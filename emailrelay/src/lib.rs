//! The emailrelay daemon: configuration, listeners and the forwarding poller.

pub mod config;
pub mod controller;
pub mod forwarder;
pub mod listener;

pub use config::{ClientConfig, Config};
pub use controller::{Emailrelay, SHUTDOWN_BROADCAST};
pub use forwarder::Forwarder;
pub use listener::Listener;

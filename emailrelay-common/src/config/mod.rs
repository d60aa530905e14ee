//! Configuration types shared between the protocol crates and the daemon.

pub mod timeouts;

pub use timeouts::{ClientTimeouts, ServerTimeouts};

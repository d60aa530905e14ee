pub mod address;
pub mod config;
pub mod logging;
pub mod status;

pub use tracing;

/// Broadcast to every long-running task when the daemon is asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
}

//! Timeout configuration for both directions of the relay.
//!
//! The protocol state machines never look at a clock; these values are consumed
//! by the reactor adapters that drive them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Inbound (server-side) timeouts, following RFC 5321 section 4.5.3.2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTimeouts {
    /// Time allowed between commands.
    ///
    /// Default: 300 seconds (5 minutes, per RFC 5321)
    #[serde(default = "defaults::server_command_secs")]
    pub command_secs: u64,

    /// Time allowed between lines of message content.
    ///
    /// Default: 180 seconds (3 minutes, per RFC 5321)
    #[serde(default = "defaults::server_data_secs")]
    pub data_secs: u64,

    /// Maximum total connection duration.
    ///
    /// Default: 1800 seconds (30 minutes)
    #[serde(default = "defaults::server_connection_secs")]
    pub connection_secs: u64,

    /// Time an external verifier program may take for one recipient.
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::server_verifier_secs")]
    pub verifier_secs: u64,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: defaults::server_command_secs(),
            data_secs: defaults::server_data_secs(),
            connection_secs: defaults::server_connection_secs(),
            verifier_secs: defaults::server_verifier_secs(),
        }
    }
}

impl ServerTimeouts {
    pub const fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub const fn data(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }

    pub const fn connection(&self) -> Duration {
        Duration::from_secs(self.connection_secs)
    }

    pub const fn verifier(&self) -> Duration {
        Duration::from_secs(self.verifier_secs)
    }
}

/// Outbound (client-side) timeouts used while forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTimeouts {
    /// Timeout for establishing the TCP connection.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_connect_secs")]
    pub connect_secs: u64,

    /// Timeout for each reply from the next-hop server.
    ///
    /// Default: 60 seconds
    #[serde(default = "defaults::client_response_secs")]
    pub response_secs: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::client_connect_secs(),
            response_secs: defaults::client_response_secs(),
        }
    }
}

impl ClientTimeouts {
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub const fn response(&self) -> Duration {
        Duration::from_secs(self.response_secs)
    }
}

mod defaults {
    pub const fn server_command_secs() -> u64 {
        300 // 5 minutes
    }
    pub const fn server_data_secs() -> u64 {
        180 // 3 minutes
    }
    pub const fn server_connection_secs() -> u64 {
        1800 // 30 minutes
    }
    pub const fn server_verifier_secs() -> u64 {
        60
    }

    pub const fn client_connect_secs() -> u64 {
        30
    }
    pub const fn client_response_secs() -> u64 {
        60
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_timeouts_defaults() {
        let timeouts = ServerTimeouts::default();
        assert_eq!(timeouts.command(), Duration::from_secs(300));
        assert_eq!(timeouts.data(), Duration::from_secs(180));
        assert_eq!(timeouts.connection(), Duration::from_secs(1800));
        assert_eq!(timeouts.verifier(), Duration::from_secs(60));
    }

    #[test]
    fn test_client_timeouts_defaults() {
        let timeouts = ClientTimeouts::default();
        assert_eq!(timeouts.connect(), Duration::from_secs(30));
        assert_eq!(timeouts.response(), Duration::from_secs(60));
    }
}

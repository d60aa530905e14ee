use std::{net::SocketAddr, path::PathBuf};

use emailrelay_common::config::ServerTimeouts;
use serde::Deserialize;

/// What the server does with a message once it is stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardMode {
    /// Queue it for the next forwarding pass.
    #[default]
    Store,
    /// Queue it and relay it straight away, before replying to the client.
    Immediate,
}

/// The `[server]` table.
///
/// ```toml
/// [server]
/// listen = ["0.0.0.0:25"]
/// hostname = "relay.example.com"
/// max_size = 10485760
/// local_domains = ["example.com"]
/// forward = "store"
///
/// [server.timeouts]
/// command_secs = 300
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::listen")]
    pub listen: Vec<SocketAddr>,

    /// Name used in the greeting, EHLO reply and outbound EHLO.
    #[serde(default = "defaults::hostname")]
    pub hostname: String,

    /// Largest accepted message in bytes; zero means unlimited.
    #[serde(default)]
    pub max_size: u64,

    /// Domains whose mailboxes are delivered locally, in addition to
    /// `localhost` and `hostname`.
    #[serde(default)]
    pub local_domains: Vec<String>,

    /// External recipient checker; the built-in rules apply when unset.
    #[serde(default)]
    pub verifier: Option<PathBuf>,

    #[serde(default)]
    pub forward: ForwardMode,

    #[serde(default)]
    pub timeouts: ServerTimeouts,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: defaults::listen(),
            hostname: defaults::hostname(),
            max_size: 0,
            local_domains: Vec::new(),
            verifier: None,
            forward: ForwardMode::default(),
            timeouts: ServerTimeouts::default(),
        }
    }
}

mod defaults {
    use std::net::{Ipv4Addr, SocketAddr};

    pub fn listen() -> Vec<SocketAddr> {
        vec![SocketAddr::from((Ipv4Addr::UNSPECIFIED, 25))]
    }

    pub fn hostname() -> String {
        std::env::var("HOSTNAME")
            .ok()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }
}

//! The daemon configuration file.

use std::path::{Path, PathBuf};

use emailrelay_common::config::ClientTimeouts;
use emailrelay_smtp::{NextHop, ServerConfig};
use emailrelay_spool::SpoolConfig;
use serde::Deserialize;

const ENV_VAR: &str = "EMAILRELAY_CONFIG";
const LOCAL_PATH: &str = "./emailrelay.toml";
const SYSTEM_PATH: &str = "/etc/emailrelay/emailrelay.toml";

/// The `[client]` table: where and how often queued mail is forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientConfig {
    /// `host:port` of the next hop; nothing is forwarded without it.
    #[serde(default)]
    pub forward_to: Option<String>,

    /// Seconds between forwarding passes; zero disables polling.
    #[serde(default = "defaults::poll_secs")]
    pub poll_secs: u64,

    #[serde(default = "defaults::forward_on_startup")]
    pub forward_on_startup: bool,

    #[serde(default)]
    pub timeouts: ClientTimeouts,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            forward_to: None,
            poll_secs: defaults::poll_secs(),
            forward_on_startup: defaults::forward_on_startup(),
            timeouts: ClientTimeouts::default(),
        }
    }
}

impl ClientConfig {
    /// The next hop, announcing ourselves as `hostname`.
    pub fn next_hop(&self, hostname: &str) -> Option<NextHop> {
        self.forward_to.as_ref().map(|address| NextHop {
            address: address.clone(),
            hostname: hostname.to_string(),
            timeouts: self.timeouts.clone(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub spool: SpoolConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

impl Config {
    /// Load the configuration file, looking in the usual places.
    ///
    /// # Errors
    /// No file was found, or the one found could not be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        let from_env = std::env::var_os(ENV_VAR).map(PathBuf::from);
        let path = locate(
            from_env,
            &[PathBuf::from(LOCAL_PATH), PathBuf::from(SYSTEM_PATH)],
        )?;

        Self::from_file(&path)
    }

    /// # Errors
    /// The file could not be read or parsed.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config from {}: {e}", path.display())
        })?;

        content
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid config in {}: {e}", path.display()))
    }
}

impl std::str::FromStr for Config {
    type Err = toml::de::Error;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        toml::from_str(content)
    }
}

/// Pick the configuration file: an explicit path must exist, otherwise the
/// first candidate that does.
fn locate(from_env: Option<PathBuf>, candidates: &[PathBuf]) -> anyhow::Result<PathBuf> {
    if let Some(path) = from_env {
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("{ENV_VAR} points to non-existent file: {}", path.display());
    }

    if let Some(path) = candidates.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = candidates
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!("No configuration file found. Tried:\n  - {ENV_VAR} environment variable\n{paths_tried}")
}

mod defaults {
    pub const fn poll_secs() -> u64 {
        60
    }

    pub const fn forward_on_startup() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, time::Duration};

    use emailrelay_smtp::ForwardMode;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_full_config() {
        let config: Config = r#"
            [server]
            listen = ["127.0.0.1:2525", "[::1]:2525"]
            hostname = "relay.example.com"
            max_size = 1048576
            local_domains = ["example.com"]
            verifier = "/usr/local/bin/verify"
            forward = "immediate"

            [server.timeouts]
            command_secs = 60

            [spool]
            path = "/var/spool/relay"

            [client]
            forward_to = "smarthost.example.com:587"
            poll_secs = 0
            forward_on_startup = false

            [client.timeouts]
            response_secs = 10
        "#
        .parse()
        .unwrap();

        assert_eq!(config.server.listen.len(), 2);
        assert_eq!(config.server.hostname, "relay.example.com");
        assert_eq!(config.server.max_size, 1_048_576);
        assert_eq!(config.server.local_domains, vec!["example.com"]);
        assert_eq!(
            config.server.verifier,
            Some(PathBuf::from("/usr/local/bin/verify"))
        );
        assert_eq!(config.server.forward, ForwardMode::Immediate);
        assert_eq!(config.server.timeouts.command(), Duration::from_secs(60));
        assert_eq!(config.server.timeouts.data(), Duration::from_secs(180));
        assert_eq!(config.spool.path(), PathBuf::from("/var/spool/relay"));
        assert_eq!(config.client.poll_secs, 0);
        assert!(!config.client.forward_on_startup);
        assert_eq!(config.client.timeouts.response(), Duration::from_secs(10));
        assert_eq!(config.client.timeouts.connect(), Duration::from_secs(30));

        let hop = config.client.next_hop(&config.server.hostname).unwrap();
        assert_eq!(hop.address, "smarthost.example.com:587");
        assert_eq!(hop.hostname, "relay.example.com");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = "".parse().unwrap();

        assert_eq!(config.server.listen, ServerConfig::default().listen);
        assert_eq!(config.server.forward, ForwardMode::Store);
        assert_eq!(config.spool, SpoolConfig::default());
        assert_eq!(config.client, ClientConfig::default());
        assert!(config.client.next_hop("localhost").is_none());
    }

    #[test]
    fn test_bad_spool_path_is_rejected() {
        let result = "[spool]\npath = \"relative/spool\"".parse::<Config>();
        assert!(result.is_err());
    }

    #[test]
    fn test_locate_prefers_explicit_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let explicit = file.path().to_path_buf();

        let found = locate(Some(explicit.clone()), &[PathBuf::from("/nonexistent")]).unwrap();
        assert_eq!(found, explicit);

        let err = locate(Some(PathBuf::from("/nonexistent/emailrelay.toml")), &[]).unwrap_err();
        assert!(err.to_string().contains("non-existent"));
    }

    #[test]
    fn test_locate_lists_every_location() {
        let candidates = [
            PathBuf::from("/nonexistent/a.toml"),
            PathBuf::from("/nonexistent/b.toml"),
        ];
        let err = locate(None, &candidates).unwrap_err().to_string();

        assert!(err.contains(ENV_VAR));
        assert!(err.contains("/nonexistent/a.toml"));
        assert!(err.contains("/nonexistent/b.toml"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emailrelay.toml");
        std::fs::write(&path, "[client]\nforward_to = \"127.0.0.1:25\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.client.forward_to.as_deref(), Some("127.0.0.1:25"));

        assert!(Config::from_file(&dir.path().join("missing.toml")).is_err());
    }
}

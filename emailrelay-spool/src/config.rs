use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::{MessageStore, Result, StoreError};

const SYSTEM_DIRECTORIES: [&str; 9] = [
    "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
];

/// Spool configuration, the `[spool]` table of the daemon configuration
///
/// ```toml
/// [spool]
/// path = "/var/spool/emailrelay"
/// ```
///
/// The path is validated while deserializing, so a configuration that loads
/// never points the store at a relative path, a `..` traversal, or a system
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolConfig {
    path: PathBuf,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/emailrelay"),
        }
    }
}

impl<'de> Deserialize<'de> for SpoolConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct SpoolConfigHelper {
            path: PathBuf,
        }

        let helper = SpoolConfigHelper::deserialize(deserializer)?;
        Self::new(helper.path).map_err(serde::de::Error::custom)
    }
}

impl SpoolConfig {
    /// # Errors
    /// Returns [`StoreError::InvalidDirectory`] if the path is not acceptable
    /// as a spool location.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the configured store.
    ///
    /// # Errors
    /// See [`MessageStore::open`].
    pub fn open(&self) -> Result<MessageStore> {
        MessageStore::open(&self.path)
    }
}

fn validate_path(path: &Path) -> Result<()> {
    let invalid = |reason: &str| StoreError::InvalidDirectory {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    if path.components().any(|c| c == Component::ParentDir) {
        return Err(invalid("path cannot contain '..' components"));
    }

    if !path.is_absolute() {
        return Err(invalid("path must be absolute"));
    }

    if let Some(prefix) = SYSTEM_DIRECTORIES.iter().find(|p| path.starts_with(p)) {
        return Err(invalid(&format!("path cannot be in system directory {prefix}")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(SpoolConfig::new("/var/spool/emailrelay").is_ok());
        assert!(SpoolConfig::new("/tmp/spool").is_ok());

        assert!(matches!(
            SpoolConfig::new("spool"),
            Err(StoreError::InvalidDirectory { .. })
        ));
        assert!(SpoolConfig::new("/var/spool/../../etc").is_err());
        assert!(SpoolConfig::new("/etc/emailrelay").is_err());
        assert!(SpoolConfig::new("/proc/self").is_err());
    }

    #[test]
    fn test_default_is_valid() {
        let config = SpoolConfig::default();
        assert!(validate_path(config.path()).is_ok());
    }
}

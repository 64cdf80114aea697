use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Tunables for the caches and the collaborator clients.
///
/// Every field has a default so a partial (or missing) config file is fine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Default time-to-live of metadata cache entries.
    pub metadata_ttl_secs: u64,
    /// Time-to-live of cached "not found" answers.
    pub error_ttl_secs: u64,
    pub metadata_max_entries: usize,
    /// Upper bound on concurrently open archive readers.
    pub archive_max_open: usize,
    /// Idle time after which an archive reader may be closed.
    pub archive_ttl_secs: u64,
    pub s3_endpoint: Option<String>,
    pub s3_region: Option<String>,
    pub ssh_program: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            metadata_ttl_secs: 30,
            error_ttl_secs: 300,
            metadata_max_entries: 1000,
            archive_max_open: 5,
            archive_ttl_secs: 300,
            s3_endpoint: None,
            s3_region: None,
            ssh_program: String::from("ssh"),
        }
    }
}

impl StoreConfig {
    const APP_NAME: &'static str = "fmstore";
    const CONFIG_NAME: &'static str = "storage";

    /// Loads `~/.config/fmstore/storage.toml`, falling back to defaults when absent.
    pub fn load() -> anyhow::Result<Self> {
        confy::load::<Self>(Self::APP_NAME, Self::CONFIG_NAME).with_context(|| {
            format!(
                "failed to load config file `{}.{}`",
                Self::APP_NAME,
                Self::CONFIG_NAME,
            )
        })
    }

    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }

    pub fn error_ttl(&self) -> Duration {
        Duration::from_secs(self.error_ttl_secs)
    }

    pub fn archive_ttl(&self) -> Duration {
        Duration::from_secs(self.archive_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let cfg: StoreConfig = load_toml("metadata_ttl_secs = 5\narchive_max_open = 2\n");
        assert_eq!(cfg.metadata_ttl(), Duration::from_secs(5));
        assert_eq!(cfg.archive_max_open, 2);
        assert_eq!(cfg.error_ttl_secs, 300);
        assert_eq!(cfg.ssh_program, "ssh");
    }

    fn load_toml(src: &str) -> StoreConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.toml");
        std::fs::write(&path, src).unwrap();
        confy::load_path(&path).unwrap()
    }
}

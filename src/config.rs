use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Node configuration, loaded from a TOML file with per-field defaults so a
/// partial file (or none at all) still yields a runnable setup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Connections kept alive in the broker pool.
    pub pool_size: usize,
    /// Fuzzer instances per run (one master, the rest secondaries).
    pub core_count: usize,
    /// Time budget handed to each dispatched fuzz run, in seconds.
    pub scheduling_interval_secs: u64,
    /// Minimized-corpus HTTP endpoint host. Unset skips that source.
    pub cmin_host: Option<String>,
    /// Working area for harness copies, seed dirs and fuzzer output.
    pub scratch_dir: PathBuf,
    /// Where outgoing seed bundles are staged.
    pub seed_dir: PathBuf,
    /// Root of the content-addressed crash store.
    pub crash_dir: PathBuf,
    /// Poll interval of the output watchdogs, in milliseconds.
    pub watch_poll_millis: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            core_count: 4,
            scheduling_interval_secs: 600,
            cmin_host: None,
            scratch_dir: PathBuf::from("/tmp/swarmfuzz"),
            seed_dir: PathBuf::from("/tmp/swarmfuzz/seeds"),
            crash_dir: PathBuf::from("/crashes"),
            watch_poll_millis: 1_000,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn scheduling_interval(&self) -> Duration {
        Duration::from_secs(self.scheduling_interval_secs)
    }

    pub fn watch_poll(&self) -> Duration {
        Duration::from_millis(self.watch_poll_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "core_count = 8\ncmin_host = \"cmin:8080\"\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.core_count, 8);
        assert_eq!(config.cmin_host.as_deref(), Some("cmin:8080"));
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.scheduling_interval(), Duration::from_secs(600));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "core_cuont = 8\n").unwrap();
        assert!(matches!(
            AppConfig::load(&path).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }
}

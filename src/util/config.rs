//! Tool configuration for Stagehand.
//!
//! This is configuration of the tool itself, not of the components being
//! assembled (that lives in the persisted `stagehand.yaml`). Two locations
//! are read:
//! - Global: `~/.stagehand/config.toml` - User-wide defaults
//! - Project: `<base>/.stagehand/config.toml` - Per-output-directory overrides
//!
//! Project config takes precedence over global config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ops::op::RetryPolicy;

/// Stagehand configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network settings used while assembling bundles
    pub net: NetConfig,

    /// Settings for the replay executor
    pub replay: ReplayConfig,
}

/// Network-related configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Attempts per registry request before giving up
    pub attempts: Option<u32>,

    /// Seconds between attempts
    pub interval_secs: Option<u64>,

    /// Per-request timeout in seconds
    pub timeout_secs: Option<u64>,

    /// Registries reached over plain HTTP or with unverified TLS
    #[serde(default)]
    pub insecure_registries: Vec<String>,

    /// Offline mode (fail instead of touching the network)
    #[serde(default)]
    pub offline: bool,
}

/// Replay-related configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// kubectl binary used for resource waits
    pub kubectl: Option<PathBuf>,

    /// Kubeconfig passed to kubectl
    pub kubeconfig: Option<PathBuf>,
}

const DEFAULT_NET_ATTEMPTS: u32 = 5;
const DEFAULT_NET_INTERVAL: u64 = 3;
const DEFAULT_NET_TIMEOUT: u64 = 120;

impl Config {
    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Load configuration with fallback to defaults if file doesn't exist.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            Self::load(path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {}: {}", path.display(), e);
                Self::default()
            })
        } else {
            Self::default()
        }
    }

    /// Merge another config into this one (other takes precedence).
    pub fn merge(&mut self, other: Config) {
        if other.net.attempts.is_some() {
            self.net.attempts = other.net.attempts;
        }
        if other.net.interval_secs.is_some() {
            self.net.interval_secs = other.net.interval_secs;
        }
        if other.net.timeout_secs.is_some() {
            self.net.timeout_secs = other.net.timeout_secs;
        }
        for registry in other.net.insecure_registries {
            if !self.net.insecure_registries.contains(&registry) {
                self.net.insecure_registries.push(registry);
            }
        }
        if other.net.offline {
            self.net.offline = true;
        }

        if other.replay.kubectl.is_some() {
            self.replay.kubectl = other.replay.kubectl;
        }
        if other.replay.kubeconfig.is_some() {
            self.replay.kubeconfig = other.replay.kubeconfig;
        }
    }

    /// Retry policy for registry and download requests.
    pub fn net_retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.net.attempts.unwrap_or(DEFAULT_NET_ATTEMPTS).max(1),
            interval: Duration::from_secs(self.net.interval_secs.unwrap_or(DEFAULT_NET_INTERVAL)),
            initial_delay: Duration::ZERO,
        }
    }

    /// Timeout applied to each HTTP request.
    pub fn net_timeout(&self) -> Duration {
        Duration::from_secs(self.net.timeout_secs.unwrap_or(DEFAULT_NET_TIMEOUT))
    }

    /// Whether `host` (a `host[:port]` string) is listed as insecure.
    pub fn is_insecure(&self, host: &str) -> bool {
        self.net.insecure_registries.iter().any(|r| r == host)
    }
}

/// Load merged configuration from global and project locations.
///
/// Order of precedence (highest to lowest):
/// 1. Project config (<base>/.stagehand/config.toml)
/// 2. Global config (~/.stagehand/config.toml)
/// 3. Defaults
pub fn load_config(global_path: Option<&Path>, project_path: &Path) -> Config {
    let mut config = Config::default();

    if let Some(global_path) = global_path {
        if global_path.exists() {
            config.merge(Config::load_or_default(global_path));
        }
    }

    if project_path.exists() {
        config.merge(Config::load_or_default(project_path));
    }

    config
}

/// Get the global stagehand config directory (~/.stagehand).
pub fn global_config_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".stagehand"))
}

/// Get the global config path (~/.stagehand/config.toml).
pub fn global_config_path() -> Option<PathBuf> {
    global_config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the project config path (<base>/.stagehand/config.toml).
pub fn project_config_path(base_dir: &Path) -> PathBuf {
    base_dir.join(".stagehand").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(!config.net.offline);
        assert!(config.replay.kubectl.is_none());

        let retry = config.net_retry();
        assert_eq!(retry.attempts, DEFAULT_NET_ATTEMPTS);
        assert_eq!(retry.interval, Duration::from_secs(DEFAULT_NET_INTERVAL));
    }

    #[test]
    fn test_config_load() {
        let tmp = TempDir::new().unwrap();
        let config_path = tmp.path().join("config.toml");

        std::fs::write(
            &config_path,
            r#"
[net]
attempts = 2
interval_secs = 1
insecure_registries = ["10.0.0.5:31000"]

[replay]
kubectl = "/opt/bin/kubectl"
"#,
        )
        .unwrap();

        let config = Config::load(&config_path).unwrap();
        assert_eq!(config.net.attempts, Some(2));
        assert!(config.is_insecure("10.0.0.5:31000"));
        assert!(!config.is_insecure("registry.example.com"));
        assert_eq!(config.replay.kubectl, Some(PathBuf::from("/opt/bin/kubectl")));
    }

    #[test]
    fn test_load_config_precedence() {
        let tmp = TempDir::new().unwrap();
        let global_path = tmp.path().join("global.toml");
        let project_path = tmp.path().join("project.toml");

        std::fs::write(
            &global_path,
            r#"
[net]
attempts = 9
timeout_secs = 30
insecure_registries = ["a:1"]
"#,
        )
        .unwrap();
        std::fs::write(
            &project_path,
            r#"
[net]
attempts = 1
insecure_registries = ["b:2"]
"#,
        )
        .unwrap();

        let config = load_config(Some(&global_path), &project_path);
        assert_eq!(config.net.attempts, Some(1));
        assert_eq!(config.net.timeout_secs, Some(30));
        assert_eq!(config.net.insecure_registries, vec!["a:1", "b:2"]);
    }

    #[test]
    fn test_broken_project_config_falls_back() {
        let tmp = TempDir::new().unwrap();
        let project_path = tmp.path().join("project.toml");
        std::fs::write(&project_path, "[net\nattempts = ").unwrap();

        let config = load_config(None, &project_path);
        assert!(config.net.attempts.is_none());
    }
}

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::proxy::memory::DEFAULT_MEMORY_BUDGET;

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_memory_budget() -> u64 {
    DEFAULT_MEMORY_BUDGET
}

fn default_client_timeout() -> u64 {
    30
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    60
}

fn default_max_header_size() -> usize {
    32 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen: SocketAddr,
    /// Fully-qualified hostnames eligible for proxying; anything else is
    /// answered with 502.
    pub targets: Vec<String>,
    /// On-disk cache root.
    pub local: PathBuf,
    /// Root directory of the stand-alone object store backing the remote
    /// tier.
    pub remote_root: PathBuf,
    /// Prepended (slash-separated) to every remote object key.
    #[serde(default)]
    pub key_prefix: String,
    /// Per-request verbose trace lines; noisy.
    #[serde(default)]
    pub log_requests: bool,
    #[serde(default = "default_memory_budget")]
    pub memory_budget: u64,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));
        builder = builder.add_source(
            Environment::with_prefix("CACHEGATE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.local = absolutize(&self.local, base_dir);
        self.remote_root = absolutize(&self.remote_root, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.targets.is_empty(),
            "at least one target host must be configured"
        );
        ensure!(
            self.targets.iter().all(|target| !target.is_empty()),
            "target hosts must not be empty strings"
        );
        ensure!(
            !self.local.as_os_str().is_empty(),
            "local cache directory must not be empty"
        );
        ensure!(
            !self.remote_root.as_os_str().is_empty(),
            "remote_root must not be empty"
        );
        ensure!(
            self.memory_budget > 0,
            "memory_budget must be greater than 0 (got {})",
            self.memory_budget
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        ensure!(
            self.max_header_size > 0,
            "max_header_size must be greater than 0 (got {})",
            self.max_header_size
        );
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config.as_deref() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/cachegate/cachegate.toml"),
        PathBuf::from("cachegate.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_settings() -> Settings {
        Settings {
            listen: "127.0.0.1:0".parse().unwrap(),
            targets: vec!["files.example".to_string()],
            local: PathBuf::from("cache"),
            remote_root: PathBuf::from("objects"),
            key_prefix: String::new(),
            log_requests: false,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            log: LogFormat::Text,
            metrics_listen: None,
            client_timeout: 30,
            upstream_connect_timeout: 5,
            upstream_timeout: 60,
            max_header_size: 32 * 1024,
        }
    }

    #[test]
    fn valid_settings_pass() {
        assert!(base_settings().validate().is_ok());
    }

    #[test]
    fn empty_targets_are_rejected() {
        let mut settings = base_settings();
        settings.targets.clear();
        assert!(settings.validate().is_err());

        settings.targets = vec![String::new()];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_budget_is_rejected() {
        let mut settings = base_settings();
        settings.memory_budget = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let mut settings = base_settings();
        settings.client_timeout = 0;
        assert!(settings.validate().is_err());

        let mut settings = base_settings();
        settings.upstream_timeout = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let mut settings = base_settings();
        settings.apply_base_dir(Path::new("/etc/cachegate/cachegate.toml"));
        assert_eq!(settings.local, PathBuf::from("/etc/cachegate/cache"));
        assert_eq!(settings.remote_root, PathBuf::from("/etc/cachegate/objects"));
    }
}

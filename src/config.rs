//! Layered daemon configuration.
//!
//! Sources, lowest priority first: built-in defaults, the TOML config file,
//! `FLASHD_*` environment variables, then command-line flags.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::device::ReconnectPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "flashd.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub rpc_bind: SocketAddr,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub archive_cache_capacity: usize,
    pub transfer_size: u16,
    pub reconnect_timeout_secs: u64,
    pub reconnect_poll_ms: u64,
    pub build_service_url: String,
    pub build_poll_secs: u64,
    pub build_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub metadata_entry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_directory: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7433)),
            simulation: true,
            verbose: false,
            json_logs: false,
            archive_cache_capacity: 16,
            transfer_size: 2048,
            reconnect_timeout_secs: 30,
            reconnect_poll_ms: 500,
            build_service_url: "https://cloudbuild.edgetx.org/api".to_string(),
            build_poll_secs: 5,
            build_timeout_secs: 1800,
            http_timeout_secs: 60,
            metadata_entry: "fw.json".to_string(),
            asset_directory: None,
        }
    }
}

impl AppConfig {
    /// Load from the default config file, the environment and `cli_args`.
    pub fn new<T: Serialize>(cli_args: Option<&T>) -> Result<Self> {
        Self::load(Path::new(DEFAULT_CONFIG_FILE), cli_args)
    }

    /// Load using `path` as the config file. A missing file is not an error.
    pub fn load<T: Serialize>(path: &Path, cli_args: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("FLASHD_"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.transfer_size == 0 {
            anyhow::bail!("transfer_size must be greater than zero");
        }
        if self.archive_cache_capacity == 0 {
            anyhow::bail!("archive_cache_capacity must be greater than zero");
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            timeout: Duration::from_secs(self.reconnect_timeout_secs),
            poll_interval: Duration::from_millis(self.reconnect_poll_ms),
        }
    }

    pub fn build_poll_interval(&self) -> Duration {
        Duration::from_secs(self.build_poll_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

//! Configuration management for the transfer coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ApiConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub node_client: NodeClientConfig,
    pub nodes: HashMap<String, NodeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long a caller waits for the block callback
    pub wait_timeout_secs: u64,
    /// Age after which the reaper closes a rendezvous
    pub pending_ttl_secs: u64,
    pub reap_interval_secs: u64,
    /// Pause between signature confirmation and latest block lookup
    pub block_fetch_delay_ms: u64,
    pub health_check_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 300,
            pending_ttl_secs: 600,
            reap_interval_secs: 120,
            block_fetch_delay_ms: 500,
            health_check_interval_secs: 30,
        }
    }
}

impl CoordinatorConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn block_fetch_delay(&self) -> Duration {
        Duration::from_millis(self.block_fetch_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeClientConfig {
    pub request_timeout_secs: u64,
    pub signature_password: String,
}

impl Default for NodeClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            signature_password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_host")]
    pub host: String,
    pub port: u16,
}

fn default_node_host() -> String {
    "localhost".to_string()
}

impl NodeConfig {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Maps a configured node name to its base URL
pub trait NodeResolver: Send + Sync {
    fn resolve(&self, node_name: &str) -> Option<String>;
}

impl NodeResolver for HashMap<String, NodeConfig> {
    fn resolve(&self, node_name: &str) -> Option<String> {
        self.get(node_name).map(NodeConfig::url)
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("TRANSFER_COORDINATOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from TOML text, substituting environment variables
    pub fn from_toml(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            anyhow::bail!("At least one node must be configured");
        }

        let coordinator = &self.coordinator;
        if coordinator.reap_interval_secs == 0 {
            anyhow::bail!("coordinator.reap_interval_secs must be positive");
        }
        if coordinator.health_check_interval_secs == 0 {
            anyhow::bail!("coordinator.health_check_interval_secs must be positive");
        }
        if coordinator.wait_timeout_secs > coordinator.pending_ttl_secs {
            anyhow::bail!(
                "coordinator.wait_timeout_secs ({}) must not exceed pending_ttl_secs ({})",
                coordinator.wait_timeout_secs,
                coordinator.pending_ttl_secs
            );
        }

        if self.node_client.signature_password.is_empty() {
            tracing::warn!("node_client.signature_password is empty");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

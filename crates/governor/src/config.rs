//! Daemon configuration

use anyhow::{Context, Result};
use governor_lib::GovernanceConfig;
use serde::Deserialize;

/// Daemon configuration, read from `GOVERNOR_*` environment variables.
///
/// Governance settings nest under `GOVERNOR_GOVERNANCE__`, for example
/// `GOVERNOR_GOVERNANCE__MAX_GROUPS=20`.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Node name from the downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port for health, metrics and group endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// JSON file with group definitions to create at startup
    #[serde(default)]
    pub groups_file: Option<String>,

    #[serde(default)]
    pub governance: GovernanceConfig,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

impl DaemonConfig {
    pub fn load() -> Result<Self> {
        Self::from_environment(environment())
    }

    fn from_environment(env: config::Environment) -> Result<Self> {
        let daemon: DaemonConfig = config::Config::builder()
            .add_source(env)
            .build()?
            .try_deserialize()
            .context("failed to parse GOVERNOR_* configuration")?;

        daemon
            .governance
            .validate()
            .context("invalid governance settings")?;
        Ok(daemon)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("GOVERNOR")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

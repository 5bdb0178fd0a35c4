//! ---
//! ads_section: "01-core-functionality"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Shared primitives and utilities for the adapter SDK."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_channel_capacity() -> usize {
    100
}

fn default_publish_capacity() -> usize {
    1_000
}

fn default_relay_capacity() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_simulation_tags() -> Vec<String> {
    vec!["Sensor1".to_owned(), "Sensor2".to_owned(), "Sensor3".to_owned()]
}

fn default_publish_interval() -> Duration {
    Duration::from_millis(1_000)
}

fn default_simulation_seed() -> u64 {
    0xADA9u64
}

/// Primary configuration object for SDK hosts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SdkConfig {
    #[serde(default)]
    pub subscriptions: SubscriptionConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Metadata describing where an [`SdkConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedSdkConfig {
    pub config: SdkConfig,
    pub source: PathBuf,
}

impl SdkConfig {
    pub const ENV_CONFIG_PATH: &str = "R_ADS_CONFIG";

    /// Load configuration from disk, respecting the `R_ADS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedSdkConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedSdkConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(path.clone())?;
                return Ok(LoadedSdkConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: PathBuf) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<SdkConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.subscriptions.validate()?;
        self.relay.validate()?;
        self.authorization.validate()?;
        self.simulation.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for SdkConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: SdkConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Behaviour applied when a subscriber's output channel is full.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued item so the newest value is always delivered.
    #[default]
    DropOldest,
    /// Keep the queued items and discard the incoming one.
    DropNewest,
}

impl OverflowPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::DropOldest => "drop-oldest",
            OverflowPolicy::DropNewest => "drop-newest",
        }
    }
}

impl std::str::FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            "drop-newest" => Ok(OverflowPolicy::DropNewest),
            other => Err(format!("unknown overflow policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Capacity of every per-subscriber output channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Capacity of the channel adapters publish upstream values into.
    #[serde(default = "default_publish_capacity")]
    pub publish_capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            publish_capacity: default_publish_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl SubscriptionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(anyhow!("subscriptions.channel_capacity must be greater than zero"));
        }
        if self.publish_capacity == 0 {
            return Err(anyhow!("subscriptions.publish_capacity must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Capacity of the bounded channel placed between adapter streams and callers.
    #[serde(default = "default_relay_capacity")]
    pub capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            capacity: default_relay_capacity(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(anyhow!("relay.capacity must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    /// Grant access to callers whose roles are not listed in `roles`.
    #[serde(default = "default_true")]
    pub default_allow: bool,
    /// Role name to the feature URIs it may use. `*` grants every feature.
    #[serde(default)]
    pub roles: IndexMap<String, Vec<String>>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            default_allow: true,
            roles: IndexMap::new(),
        }
    }
}

impl AuthorizationConfig {
    pub fn validate(&self) -> Result<()> {
        for (role, features) in &self.roles {
            if role.trim().is_empty() {
                return Err(anyhow!("authorization role names must not be empty"));
            }
            if features.iter().any(|uri| uri.trim().is_empty()) {
                return Err(anyhow!(
                    "authorization role '{}' lists an empty feature uri",
                    role
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_simulation_tags")]
    pub tags: Vec<String>,
    #[serde(default = "default_publish_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub publish_interval: Duration,
    #[serde(default = "default_simulation_seed")]
    pub random_seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tags: default_simulation_tags(),
            publish_interval: default_publish_interval(),
            random_seed: default_simulation_seed(),
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.publish_interval.is_zero() {
            return Err(anyhow!("simulation.publish_interval must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn empty_document_uses_defaults() {
        let config = SdkConfig::from_str("").unwrap();
        assert_eq!(config.subscriptions.channel_capacity, 100);
        assert_eq!(config.subscriptions.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.relay.capacity, 16);
        assert!(config.authorization.default_allow);
        assert_eq!(config.simulation.tags.len(), 3);
    }

    #[test]
    fn parses_sections() {
        let config = SdkConfig::from_str(
            r#"
            [subscriptions]
            channel_capacity = 4
            overflow = "drop-newest"

            [relay]
            capacity = 2

            [authorization]
            default_allow = false
            [authorization.roles]
            viewer = ["asc:features/real-time-data/values/read/snapshot/"]

            [simulation]
            tags = ["Pump1"]
            publish_interval = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.subscriptions.channel_capacity, 4);
        assert_eq!(config.subscriptions.overflow, OverflowPolicy::DropNewest);
        assert_eq!(config.relay.capacity, 2);
        assert!(!config.authorization.default_allow);
        assert_eq!(config.authorization.roles["viewer"].len(), 1);
        assert_eq!(config.simulation.publish_interval, Duration::from_millis(250));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = SdkConfig::from_str("[subscriptions]\nchannel_capacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("channel_capacity"));
    }

    #[test]
    fn load_prefers_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sdk.toml");
        std::fs::write(&path, "[relay]\ncapacity = 8\n").unwrap();
        let missing = dir.path().join("missing.toml");

        let loaded = SdkConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.relay.capacity, 8);
    }

    #[test]
    fn overflow_policy_from_str() {
        assert_eq!(
            OverflowPolicy::from_str("DROP-NEWEST").unwrap(),
            OverflowPolicy::DropNewest
        );
        assert!(OverflowPolicy::from_str("block").is_err());
    }
}

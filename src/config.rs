use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, RotationError};
use crate::identity::Subnet;

pub const DEFAULT_SUBNET: &str = "10.0.0.0/8";
pub const DEFAULT_ROTATION_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_POOL_SIZE: usize = 1000;
/// Ten years.
pub const MAX_ROTATION_INTERVAL_SECS: u64 = 315_360_000;

/// Top-level configuration: shared network settings plus one entry per agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default, alias = "bots")]
    pub agents: BTreeMap<String, AgentSettings>,
}

/// On-disk form; carries a write timestamp next to the config itself
#[derive(Serialize, Deserialize)]
struct Snapshot {
    #[serde(flatten)]
    config: RotationConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<DateTime<Utc>>,
}

/// Pool, catalog and history settings shared by every agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub subnet: String,
    pub port_range: (u16, u16),
    pub pool_size: usize,
    pub low_water_mark: usize,
    pub rotation_strategy: RotationStrategy,
    pub max_history_size: usize,
    pub proxy_sources: Vec<String>,
    pub tunnel_endpoints: Vec<String>,
    pub proxies_per_agent: usize,
    pub tunnels_per_agent: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnet: DEFAULT_SUBNET.to_string(),
            port_range: (8000, 9000),
            pool_size: DEFAULT_POOL_SIZE,
            low_water_mark: 100,
            rotation_strategy: RotationStrategy::Random,
            max_history_size: 100,
            proxy_sources: vec![
                "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt".to_string(),
                "https://raw.githubusercontent.com/clarketm/proxy-list/master/proxy-list-raw.txt"
                    .to_string(),
                "https://raw.githubusercontent.com/sunny9577/proxy-scraper/master/proxies.txt"
                    .to_string(),
            ],
            tunnel_endpoints: (1..=5)
                .map(|n| format!("tunnel{n}.example.net:1194"))
                .collect(),
            proxies_per_agent: 10,
            tunnels_per_agent: 3,
        }
    }
}

impl NetworkConfig {
    /// Parsed subnet, falling back to the default network when malformed
    pub fn subnet(&self) -> Subnet {
        self.subnet.parse().unwrap_or_default()
    }
}

/// How the next identity is picked from the free set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Random,
}

/// Per-agent rotation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    #[serde(alias = "rotation_interval")]
    pub rotation_interval_secs: u64,
    pub proxy_enabled: bool,
    #[serde(alias = "vpn_enabled")]
    pub tunnel_enabled: bool,
    pub stealth_mode: bool,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            rotation_interval_secs: DEFAULT_ROTATION_INTERVAL_SECS,
            proxy_enabled: true,
            tunnel_enabled: false,
            stealth_mode: true,
        }
    }
}

impl AgentSettings {
    pub fn with_interval(rotation_interval_secs: u64) -> Self {
        Self {
            rotation_interval_secs,
            ..Self::default()
        }
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            agents: default_agents(),
        }
    }
}

/// The built-in fleet: four agents on 300/240/180/120 second intervals
pub fn default_agents() -> BTreeMap<String, AgentSettings> {
    [("alpha", 300, false), ("beta", 240, true), ("gamma", 180, false), ("delta", 120, true)]
        .into_iter()
        .map(|(id, interval, tunnel_enabled)| {
            let settings = AgentSettings {
                rotation_interval_secs: interval,
                proxy_enabled: true,
                tunnel_enabled,
                stealth_mode: true,
            };
            (id.to_string(), settings)
        })
        .collect()
}

impl RotationConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let snapshot: Snapshot = serde_json::from_str(&raw)?;
        Ok(snapshot.config)
    }

    /// Never fails: a missing or unreadable file yields the defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut config = if path.exists() {
            match Self::load(path) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("falling back to default config, {} unusable: {}", path.display(), e);
                    Self::default()
                }
            }
        } else {
            log::info!("no config at {}, using defaults", path.display());
            Self::default()
        };
        config.normalize();
        config
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let snapshot = Snapshot {
            config: self.clone(),
            last_updated: Some(Utc::now()),
        };
        fs::write(path, serde_json::to_string_pretty(&snapshot)?)?;
        Ok(())
    }

    /// Repairs values the pool and scheduler cannot work with.
    pub fn normalize(&mut self) {
        if self.network.subnet.parse::<Subnet>().is_err() {
            log::warn!(
                "malformed subnet `{}`, using {}",
                self.network.subnet,
                DEFAULT_SUBNET
            );
            self.network.subnet = DEFAULT_SUBNET.to_string();
        }
        let (low, high) = self.network.port_range;
        if low > high {
            self.network.port_range = (high, low);
        }
        if self.agents.is_empty() {
            log::warn!("no agents configured, using the built-in fleet");
            self.agents = default_agents();
        }
        let fleet = self.agents.len();
        if self.network.subnet().host_count() < fleet as u64 {
            log::warn!(
                "subnet {} cannot hold {fleet} agents, using {}",
                self.network.subnet,
                DEFAULT_SUBNET
            );
            self.network.subnet = DEFAULT_SUBNET.to_string();
        }
        if self.network.pool_size < fleet {
            let repaired = DEFAULT_POOL_SIZE.max(fleet);
            log::warn!(
                "pool size {} cannot serve {fleet} agents, using {repaired}",
                self.network.pool_size
            );
            self.network.pool_size = repaired;
        }
        for (id, settings) in self.agents.iter_mut() {
            if settings.rotation_interval_secs == 0 {
                log::warn!("agent {id} has a zero rotation interval, using {DEFAULT_ROTATION_INTERVAL_SECS}s");
                settings.rotation_interval_secs = DEFAULT_ROTATION_INTERVAL_SECS;
            }
            settings.rotation_interval_secs =
                settings.rotation_interval_secs.min(MAX_ROTATION_INTERVAL_SECS);
        }
    }
}

/// A closed set of per-agent fields that may change at runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub rotation_interval_secs: Option<u64>,
    pub proxy_enabled: Option<bool>,
    pub tunnel_enabled: Option<bool>,
    pub stealth_mode: Option<bool>,
}

impl ConfigUpdate {
    /// Parses a single `key = value` pair, rejecting unknown keys
    pub fn from_key_value(key: &str, value: &str) -> Result<Self, RotationError> {
        let mut update = Self::default();
        match key {
            "rotation_interval" | "rotation_interval_secs" => {
                let secs = value.parse::<u64>().map_err(|_| {
                    RotationError::InvalidConfig(format!("`{value}` is not a number of seconds"))
                })?;
                update.rotation_interval_secs = Some(secs);
            }
            "proxy_enabled" => update.proxy_enabled = Some(parse_flag(value)?),
            "tunnel_enabled" | "vpn_enabled" => update.tunnel_enabled = Some(parse_flag(value)?),
            "stealth_mode" => update.stealth_mode = Some(parse_flag(value)?),
            other => return Err(RotationError::UnknownField(other.to_string())),
        }
        Ok(update)
    }

    pub fn validate(&self) -> Result<(), RotationError> {
        match self.rotation_interval_secs {
            Some(0) => Err(RotationError::InvalidConfig(
                "rotation interval must be greater than zero".to_string(),
            )),
            Some(secs) if secs > MAX_ROTATION_INTERVAL_SECS => Err(RotationError::InvalidConfig(
                format!("rotation interval may not exceed {MAX_ROTATION_INTERVAL_SECS}s"),
            )),
            _ => Ok(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn parse_flag(value: &str) -> Result<bool, RotationError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(RotationError::InvalidConfig(format!("`{value}` is not a boolean"))),
    }
}

/// Background timing knobs. Not persisted.
#[derive(Debug, Clone)]
pub struct Timings {
    pub poll_interval: Duration,
    pub failure_backoff: Duration,
    pub maintenance_interval: Duration,
    pub endpoint_refresh_interval: Duration,
    pub fetch_timeout: Duration,
    pub probe_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            failure_backoff: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(3600),
            endpoint_refresh_interval: Duration::from_secs(1800),
            fetch_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

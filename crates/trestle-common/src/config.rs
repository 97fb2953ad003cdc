// Bridge configuration: defaults, env overrides, optional YAML override file.
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::LimitsConfig;

/// Configuration for one bridge instance.
///
/// ```
/// use trestle_common::BridgeConfig;
///
/// let config = BridgeConfig::new("events");
/// assert_eq!(config.channel, "events");
/// assert_eq!(config.limits.bulk_size, 1024);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Logical name grouping this bridge's endpoints.
    pub channel: String,
    /// Bind address for the inbound (producer-facing) listener.
    pub inbound_bind: String,
    /// Bind address for the outbound (consumer-facing) listener.
    pub outbound_bind: String,
    pub limits: LimitsConfig,
}

impl BridgeConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        // Ephemeral local ports by default so multiple bridges can coexist.
        Self {
            channel: channel.into(),
            inbound_bind: "tcp://127.0.0.1:*".to_string(),
            outbound_bind: "tcp://127.0.0.1:*".to_string(),
            limits: LimitsConfig::default(),
        }
    }

    /// Build from env vars, then apply an optional YAML override file named
    /// by `TRESTLE_BRIDGE_CONFIG` (or an explicit path).
    pub fn from_env_or_yaml(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("TRESTLE_BRIDGE_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read bridge config: {path}"))?;
            let override_cfg: BridgeConfigOverride =
                serde_yaml::from_str(&contents).context("parse bridge config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    fn from_env() -> Self {
        let mut config = Self::new(
            std::env::var("TRESTLE_CHANNEL").unwrap_or_else(|_| "default".to_string()),
        );
        if let Ok(value) = std::env::var("TRESTLE_INBOUND_BIND") {
            config.inbound_bind = value;
        }
        if let Ok(value) = std::env::var("TRESTLE_OUTBOUND_BIND") {
            config.outbound_bind = value;
        }
        if let Some(value) = read_usize_env("TRESTLE_BULK_SIZE") {
            config.limits.bulk_size = value;
        }
        if let Some(value) = read_usize_env("TRESTLE_MAX_FRAME_BYTES") {
            config.limits.max_frame_bytes = value;
        }
        config
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct BridgeConfigOverride {
    channel: Option<String>,
    inbound_bind: Option<String>,
    outbound_bind: Option<String>,
    bulk_size: Option<usize>,
    max_frame_bytes: Option<usize>,
}

impl BridgeConfigOverride {
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(value) = &self.channel {
            config.channel = value.clone();
        }
        if let Some(value) = &self.inbound_bind {
            config.inbound_bind = value.clone();
        }
        if let Some(value) = &self.outbound_bind {
            config.outbound_bind = value.clone();
        }
        if let Some(value) = self.bulk_size {
            if value > 0 {
                config.limits.bulk_size = value;
            }
        }
        if let Some(value) = self.max_frame_bytes {
            if value > 0 {
                config.limits.max_frame_bytes = value;
            }
        }
    }
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

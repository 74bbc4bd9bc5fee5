// =============================================================================
// Runtime Configuration — JSON file with serde defaults + env overrides
// =============================================================================
//
// Every field carries `#[serde(default)]` so adding new options never breaks
// loading an older config file. Environment variables override the file for
// the handful of settings that differ per deployment.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

fn default_store_path() -> String {
    "pulsewatch.db".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_ticker_blacklist() -> Vec<String> {
    vec!["USDC".to_string(), "BUSD".to_string()]
}

fn default_price_poll_secs() -> u64 {
    1
}

fn default_minute_poll_secs() -> u64 {
    60
}

fn default_base_step_secs() -> u64 {
    5
}

fn default_retention_sweep_secs() -> u64 {
    600
}

/// Engine settings, loadable from `pulsewatch.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Path of the embedded metric store.
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// HTTP/WebSocket bind address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Symbol substrings excluded from every pipeline.
    #[serde(default = "default_ticker_blacklist")]
    pub ticker_blacklist: Vec<String>,

    /// Price snapshot cadence.
    #[serde(default = "default_price_poll_secs")]
    pub price_poll_secs: u64,

    /// Trade-count kline poll cadence.
    #[serde(default = "default_minute_poll_secs")]
    pub trade_count_poll_secs: u64,

    /// Open-interest poll cadence.
    #[serde(default = "default_minute_poll_secs")]
    pub open_interest_poll_secs: u64,

    /// Funding (premium index) poll cadence.
    #[serde(default = "default_minute_poll_secs")]
    pub funding_poll_secs: u64,

    /// Composite scheduler base step.
    #[serde(default = "default_base_step_secs")]
    pub composite_base_step_secs: u64,

    /// Store retention sweep cadence.
    #[serde(default = "default_retention_sweep_secs")]
    pub retention_sweep_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults always deserialize")
    }
}

impl RuntimeConfig {
    /// Load from `path` when present, fall back to defaults otherwise, then
    /// apply env overrides.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            let config: RuntimeConfig = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config file {path}"))?;
            info!(path, "runtime config loaded");
            config
        } else {
            warn!(path, "config file not found — using defaults");
            RuntimeConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PULSEWATCH_DB") {
            self.store_path = v;
        }
        if let Ok(v) = std::env::var("PULSEWATCH_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("PULSEWATCH_BLACKLIST") {
            self.ticker_blacklist = v
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.price_poll_secs, 1);
        assert_eq!(config.open_interest_poll_secs, 60);
        assert_eq!(config.composite_base_step_secs, 5);
        assert!(config.ticker_blacklist.contains(&"USDC".to_string()));
    }

    #[test]
    fn partial_file_fills_missing_fields() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"bind_addr": "127.0.0.1:9000"}"#).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.store_path, "pulsewatch.db");
        assert_eq!(config.funding_poll_secs, 60);
    }
}

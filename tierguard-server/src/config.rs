// Copyright 2025 Tierguard Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tierguard_core::{
    DropPolicy, EngineConfig, Importance, ParamMap, PolicyUpdate, RouteKey, Tier, TierRegistry,
    TierRule,
};

use crate::dispatcher::DispatcherConfig;

/// Tierguard Server Configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default = "default_tiers")]
    pub tiers: Vec<Tier>,

    /// Ordered tier-resolution table; first match wins
    #[serde(default = "default_rules")]
    pub rules: Vec<TierRule>,

    /// Target p95 latency (ms) per `service:path`
    #[serde(default)]
    pub targets: BTreeMap<RouteKey, f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {:?} (expected text or json)", other)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Filter used when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "tierguard_server=info,tierguard_core=info".to_string()
}

fn profile(entries: &[(&str, f64)]) -> ParamMap {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

fn default_tiers() -> Vec<Tier> {
    vec![
        Tier {
            name: "gold".to_string(),
            rps_max: 120.0,
            burst: 240,
            concurrency_max: 64,
            queue_ms_max: 2_000,
            deadline_ms: 5_000,
            weight: 4.0,
            drop_policy: DropPolicy::Protected,
            degrade_profile: profile(&[
                ("max_output_tokens", 2_048.0),
                ("top_k", 10.0),
                ("timeout_ms", 10_000.0),
                ("rerank", 1.0),
                ("personalization", 1.0),
                ("streaming", 1.0),
            ]),
        },
        Tier {
            name: "silver".to_string(),
            rps_max: 60.0,
            burst: 120,
            concurrency_max: 32,
            queue_ms_max: 1_000,
            deadline_ms: 3_000,
            weight: 2.0,
            drop_policy: DropPolicy::Standard,
            degrade_profile: profile(&[
                ("max_output_tokens", 1_024.0),
                ("top_k", 8.0),
                ("timeout_ms", 5_000.0),
                ("rerank", 1.0),
                ("streaming", 1.0),
            ]),
        },
        Tier {
            name: "bronze".to_string(),
            rps_max: 20.0,
            burst: 40,
            concurrency_max: 16,
            queue_ms_max: 500,
            deadline_ms: 2_000,
            weight: 1.0,
            drop_policy: DropPolicy::Eager,
            degrade_profile: profile(&[
                ("max_output_tokens", 512.0),
                ("top_k", 5.0),
                ("timeout_ms", 3_000.0),
            ]),
        },
    ]
}

fn default_rules() -> Vec<TierRule> {
    vec![
        TierRule {
            tier: "gold".to_string(),
            min_importance: Some(Importance::Critical),
            ..Default::default()
        },
        TierRule {
            tier: "silver".to_string(),
            min_importance: Some(Importance::High),
            ..Default::default()
        },
        TierRule {
            tier: "bronze".to_string(),
            ..Default::default()
        },
    ]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            dispatcher: DispatcherConfig::default(),
            log: LogConfig::default(),
            tiers: default_tiers(),
            rules: default_rules(),
            targets: BTreeMap::new(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        Ok(config)
    }

    /// Apply environment overrides
    ///
    /// Supported environment variables:
    /// - TIERGUARD_TICK_MS: maintenance tick interval in milliseconds
    /// - TIERGUARD_LOG_FORMAT: `text` or `json`
    /// - TIERGUARD_MAX_SHARE_PCT: per-tenant admitted share cap
    /// - TIERGUARD_CHANNEL_CAPACITY: capacity of each inbound channel
    pub fn apply_env(&mut self) {
        if let Some(tick_ms) = env_parse("TIERGUARD_TICK_MS") {
            self.dispatcher.tick_interval_ms = tick_ms;
        }
        if let Some(format) = env_parse("TIERGUARD_LOG_FORMAT") {
            self.log.format = format;
        }
        if let Some(share) = env_parse("TIERGUARD_MAX_SHARE_PCT") {
            self.engine.max_share_pct_per_tenant = share;
        }
        if let Some(capacity) = env_parse("TIERGUARD_CHANNEL_CAPACITY") {
            self.dispatcher.channel_capacity = capacity;
        }
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Initial policy handed to the engine
    pub fn policy(&self) -> PolicyUpdate {
        PolicyUpdate {
            tiers: self.tiers.clone(),
            rules: self.rules.clone(),
            targets: self.targets.clone(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        if self.dispatcher.tick_interval_ms == 0 {
            anyhow::bail!("dispatcher.tick_interval_ms must be positive");
        }
        if self.dispatcher.channel_capacity == 0 || self.dispatcher.outbound_capacity == 0 {
            anyhow::bail!("dispatcher channel capacities must be positive");
        }
        if self.tiers.is_empty() {
            anyhow::bail!("at least one tier must be configured");
        }

        TierRegistry::build(0, self.tiers.clone(), self.rules.clone())?;

        for (route, target) in &self.targets {
            if !target.is_finite() || *target <= 0.0 {
                anyhow::bail!("latency target for {} must be positive, got {}", route, target);
            }
        }

        Ok(())
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::constants::{
    DEFAULT_CACHE_MEMORY_ENTRIES, DEFAULT_CONFIRM_TIMEOUT, DEFAULT_MAX_UNCONFIRMED,
    DEFAULT_RATE_BURST_MULTIPLIER, DEFAULT_WRITE_TIMEOUT,
};
use crate::errors::ConfigError;
use crate::rate_limiter::{parse_rate, RateLimiter};
use crate::tags::TagPattern;

// processor rule keys and the environment variables that feed them
const PROCESSOR_RULE_VARS: [(&str, &str); 4] = [
    ("exclude_at_match", "INGEST_EXCLUDE_AT_MATCH"),
    ("include_at_match", "INGEST_INCLUDE_AT_MATCH"),
    ("mask_sequences", "INGEST_MASK_SEQUENCES"),
    ("mask_placeholder", "INGEST_MASK_PLACEHOLDER"),
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Allowed tag names and single-`*` patterns.
    pub tags: Vec<String>,
    /// Collector addresses in preference order.
    pub destinations: Vec<String>,
    pub max_unconfirmed: usize,
    /// Aggregate egress cap, e.g. `"10Mbps"`. Unlimited when unset.
    pub rate_limit: Option<String>,
    pub rate_burst_multiplier: f64,
    pub cache_enabled: bool,
    pub cache_path: Option<PathBuf>,
    pub cache_max_size_mb: Option<u64>,
    pub cache_memory_entries: usize,
    /// 0 disables the write deadline.
    pub write_timeout_ms: u64,
    pub confirm_timeout_ms: u64,
    pub log_level: String,
    /// Passed to the payload rule processor; no processor is installed when empty.
    pub processor_rules: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            destinations: Vec::new(),
            max_unconfirmed: DEFAULT_MAX_UNCONFIRMED,
            rate_limit: None,
            rate_burst_multiplier: DEFAULT_RATE_BURST_MULTIPLIER,
            cache_enabled: false,
            cache_path: None,
            cache_max_size_mb: None,
            cache_memory_entries: DEFAULT_CACHE_MEMORY_ENTRIES,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT.as_millis() as u64,
            confirm_timeout_ms: DEFAULT_CONFIRM_TIMEOUT.as_millis() as u64,
            log_level: "info".to_string(),
            processor_rules: HashMap::new(),
        }
    }
}

impl Config {
    /// Reads `INGEST_*` environment variables over the defaults and validates the result.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(tags) = env::var("INGEST_TAGS") {
            // Space-separated is canonical; commas are accepted too.
            config.tags = tags
                .replace(',', " ")
                .split_whitespace()
                .map(str::to_string)
                .collect();
        }
        if let Ok(destinations) = env::var("INGEST_DESTINATIONS") {
            config.destinations = destinations
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(max) = parse_var("INGEST_MAX_UNCONFIRMED")? {
            config.max_unconfirmed = max;
        }
        config.rate_limit = env::var("INGEST_RATE_LIMIT")
            .ok()
            .filter(|r| !r.trim().is_empty());
        if let Some(multiplier) = parse_var("INGEST_RATE_BURST_MULTIPLIER")? {
            config.rate_burst_multiplier = multiplier;
        }
        if let Some(enabled) = parse_var("INGEST_CACHE_ENABLED")? {
            config.cache_enabled = enabled;
        }
        config.cache_path = env::var("INGEST_CACHE_PATH").ok().map(PathBuf::from);
        config.cache_max_size_mb = parse_var("INGEST_CACHE_MAX_SIZE_MB")?;
        if let Some(entries) = parse_var("INGEST_CACHE_MEMORY_ENTRIES")? {
            config.cache_memory_entries = entries;
        }
        if let Some(ms) = parse_var("INGEST_WRITE_TIMEOUT_MS")? {
            config.write_timeout_ms = ms;
        }
        if let Some(ms) = parse_var("INGEST_CONFIRM_TIMEOUT_MS")? {
            config.confirm_timeout_ms = ms;
        }
        if let Ok(level) = env::var("INGEST_LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }
        for (key, var) in PROCESSOR_RULE_VARS {
            if let Ok(value) = env::var(var) {
                config.processor_rules.insert(key.to_string(), value);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.destinations.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one destination is required".to_string(),
            ));
        }
        if self.max_unconfirmed == 0 {
            return Err(ConfigError::Invalid(
                "max_unconfirmed must be greater than zero".to_string(),
            ));
        }
        if self.confirm_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "confirm_timeout_ms must be greater than zero".to_string(),
            ));
        }
        for tag in &self.tags {
            TagPattern::parse(tag)?;
        }
        if let Some(rate) = self.rate_limit_bytes()? {
            RateLimiter::new(rate, self.rate_burst_multiplier)?;
        }
        if self.cache_enabled && self.cache_path.is_none() {
            return Err(ConfigError::Invalid(
                "cache is enabled but no cache path is set".to_string(),
            ));
        }
        Ok(())
    }

    /// Parsed rate limit in bytes per second.
    pub fn rate_limit_bytes(&self) -> Result<Option<i64>, ConfigError> {
        self.rate_limit
            .as_deref()
            .map(parse_rate)
            .transpose()
            .map_err(ConfigError::from)
    }

    #[must_use]
    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }

    #[must_use]
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    #[must_use]
    pub fn cache_config(&self) -> Option<CacheConfig> {
        if !self.cache_enabled {
            return None;
        }
        self.cache_path.as_ref().map(|path| CacheConfig {
            path: path.clone(),
            max_disk_bytes: self.cache_max_size_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
            memory_entries: self.cache_memory_entries,
        })
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{name} has an invalid value {raw:?}"))),
        _ => Ok(None),
    }
}

//! Typed engine configuration.
//!
//! Configuration is declarative and strict: every struct rejects unknown
//! options at load time (`deny_unknown_fields`), not at use time. The engine
//! derives run identity from a SHA-256 hash of the canonical JSON encoding of
//! this configuration (minus `data_dir`, which locates state but does not
//! change what the run computes).
//!
//! # Configuration File Format
//!
//! ```toml
//! data_dir = "/var/lib/quorum"
//! concurrency = 5
//! call_timeout_ms = 60000
//! cancel_debounce_ms = 400
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 250
//! max_delay_ms = 5000
//!
//! [screener]
//! confident_include = 0.85
//! confident_exclude = 0.85
//! kappa_floor = 0.6
//!
//! [[tiers]]
//! name = "decision"
//! capacity = 5
//! refill_per_sec = 2.0
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::retry::RetryPolicy;

/// One named rate tier: a token bucket with `capacity` burst and continuous
/// refill at `refill_per_sec` tokens per second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    pub name: String,
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl TierConfig {
    pub fn new(name: impl Into<String>, capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            name: name.into(),
            capacity,
            refill_per_sec,
        }
    }
}

/// Consensus screening thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScreenerConfig {
    /// Confidence an `include` decision must reach to win a disagreement
    /// without adjudication.
    #[serde(default = "default_confident_include")]
    pub confident_include: f64,
    /// Confidence an `exclude` decision must reach to win a disagreement
    /// without adjudication.
    #[serde(default = "default_confident_exclude")]
    pub confident_exclude: f64,
    /// Agreement coefficient below this floor sets the warning flag on the
    /// stage statistic.
    #[serde(default = "default_kappa_floor")]
    pub kappa_floor: f64,
}

fn default_confident_include() -> f64 {
    0.85
}

fn default_confident_exclude() -> f64 {
    0.85
}

fn default_kappa_floor() -> f64 {
    0.6
}

impl Default for ScreenerConfig {
    fn default() -> Self {
        Self {
            confident_include: default_confident_include(),
            confident_exclude: default_confident_exclude(),
            kappa_floor: default_kappa_floor(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Root directory for the registry and per-run stores.
    pub data_dir: PathBuf,
    /// Default per-phase concurrency bound (phases may override).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Wall-clock timeout for one processor invocation, in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Window within which repeated interrupt deliveries are treated as
    /// duplicates rather than escalation, in milliseconds.
    #[serde(default = "default_cancel_debounce_ms")]
    pub cancel_debounce_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub screener: ScreenerConfig,
    #[serde(default)]
    pub tiers: Vec<TierConfig>,
}

fn default_concurrency() -> usize {
    4
}

fn default_call_timeout_ms() -> u64 {
    60_000
}

fn default_cancel_debounce_ms() -> u64 {
    400
}

impl EngineConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            concurrency: default_concurrency(),
            call_timeout_ms: default_call_timeout_ms(),
            cancel_debounce_ms: default_cancel_debounce_ms(),
            retry: RetryPolicy::default(),
            screener: ScreenerConfig::default(),
            tiers: Vec::new(),
        }
    }

    /// Load from a TOML file. Unknown keys are rejected.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// Parse from a TOML string. Unknown keys are rejected.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse engine configuration")
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_call_timeout_ms(mut self, ms: u64) -> Self {
        self.call_timeout_ms = ms;
        self
    }

    pub fn with_cancel_debounce_ms(mut self, ms: u64) -> Self {
        self.cancel_debounce_ms = ms;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_screener(mut self, screener: ScreenerConfig) -> Self {
        self.screener = screener;
        self
    }

    pub fn with_tier(mut self, tier: TierConfig) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Stable content hash of this configuration.
    ///
    /// `data_dir` is excluded: it locates persisted state, it is not part of
    /// run identity. The remaining fields are hashed over their canonical
    /// JSON encoding (sorted keys), so semantically identical configurations
    /// hash identically across processes.
    pub fn content_hash(&self) -> Result<String> {
        let mut value =
            serde_json::to_value(self).context("Failed to serialize configuration for hashing")?;
        if let Some(map) = value.as_object_mut() {
            map.remove("data_dir");
        }
        let canonical =
            serde_json::to_string(&value).context("Failed to render canonical configuration")?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(hex::encode(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = EngineConfig::new("/tmp/q");
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.call_timeout_ms, 60_000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.screener.kappa_floor, 0.6);
        assert!(config.tiers.is_empty());
    }

    #[test]
    fn toml_roundtrip() {
        let raw = r#"
            data_dir = "/var/lib/quorum"
            concurrency = 8

            [retry]
            max_attempts = 5

            [[tiers]]
            name = "decision"
            capacity = 5
            refill_per_sec = 2.0
        "#;
        let config = EngineConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 250, "unset fields take defaults");
        assert_eq!(config.tiers.len(), 1);
        assert_eq!(config.tiers[0].name, "decision");
    }

    #[test]
    fn unknown_option_rejected_at_load_time() {
        let raw = r#"
            data_dir = "/var/lib/quorum"
            concurency = 8
        "#;
        assert!(EngineConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn unknown_nested_option_rejected() {
        let raw = r#"
            data_dir = "/var/lib/quorum"

            [screener]
            kappa_flor = 0.5
        "#;
        assert!(EngineConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn content_hash_is_stable_and_ignores_data_dir() {
        let a = EngineConfig::new("/tmp/a").with_concurrency(8);
        let b = EngineConfig::new("/tmp/b").with_concurrency(8);
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }

    #[test]
    fn content_hash_tracks_semantic_changes() {
        let a = EngineConfig::new("/tmp/a").with_concurrency(8);
        let b = EngineConfig::new("/tmp/a").with_concurrency(9);
        assert_ne!(a.content_hash().unwrap(), b.content_hash().unwrap());

        let c = EngineConfig::new("/tmp/a")
            .with_concurrency(8)
            .with_tier(TierConfig::new("decision", 5, 2.0));
        assert_ne!(a.content_hash().unwrap(), c.content_hash().unwrap());
    }
}

//! Coordination settings
//!
//! Settings are read from TOML, then overridden by `SHARDLINE_<SECTION>_<KEY>`
//! environment variables, then validated into [`ValidatedSettings`]:
//!
//! ```toml
//! [shards]
//! static = true
//! total_count = 4
//! assigned = [0, 2]
//!
//! [processors]
//! polling_interval = 100      # ms
//! pulse_interval = 2000       # ms, >= polling_interval
//! pulse_expiration = 30000    # ms, >= 3 * pulse_interval
//! batch_size = 50
//! retry_delay = 0             # ms
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "SHARDLINE";

/// Upper bound for every interval setting: one week.
pub const MAX_INTERVAL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationSettings {
    pub shards: ShardSettings,
    pub processors: ProcessorSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardSettings {
    /// Static assignment from `total_count`/`assigned` instead of dynamic rebalancing
    #[serde(rename = "static")]
    pub is_static: bool,

    pub total_count: Option<i64>,

    pub assigned: Option<Vec<i64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSettings {
    /// Whether this node runs event processors at all
    pub enabled: bool,

    /// Delay between polls of an idle shard (ms)
    pub polling_interval: u64,

    /// Delay between pulses (ms)
    pub pulse_interval: u64,

    /// Lease duration written on each pulse (ms)
    pub pulse_expiration: u64,

    pub batch_size: u32,

    /// Upper bound on apply + delete of one batch (ms)
    pub transaction_timeout: Option<u64>,

    /// Delay before a failed batch is retried (ms)
    pub retry_delay: u64,

    /// Consecutive batches drained before yielding to the schedule
    pub max_consecutive_batches: u32,

    /// Attempts per batch before the processor halts; unbounded if absent
    pub max_retry_attempts: Option<u32>,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            polling_interval: 100,
            pulse_interval: 2_000,
            pulse_expiration: 30_000,
            batch_size: 50,
            transaction_timeout: None,
            retry_delay: 0,
            max_consecutive_batches: 16,
            max_retry_attempts: None,
        }
    }
}

/// How a failing batch is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry the same batch until it succeeds; the shard stalls meanwhile.
    Unbounded,
    /// Halt the processor after `max_attempts` failed attempts of one batch.
    Bounded { max_attempts: u32 },
}

impl RetryPolicy {
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        match self {
            RetryPolicy::Unbounded => false,
            RetryPolicy::Bounded { max_attempts } => attempts >= *max_attempts,
        }
    }
}

/// Shard assignment mode after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sharding {
    /// Assignment recomputed from the live agents on every pulse
    Dynamic,
    /// Fixed indices, deduplicated and sorted
    Static { total_count: u32, assigned: Vec<u32> },
}

/// Settings checked for consistency, with intervals as [`Duration`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSettings {
    pub sharding: Sharding,
    pub polling_interval: Duration,
    pub pulse_interval: Duration,
    pub pulse_expiration: Duration,
    pub batch_size: u32,
    pub transaction_timeout: Option<Duration>,
    pub retry_delay: Duration,
    pub max_consecutive_batches: u32,
    pub retry_policy: RetryPolicy,
}

impl CoordinationSettings {
    /// Load settings from a TOML file, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        let mut settings = Self::from_toml_str(&contents)?;
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Override settings from `SHARDLINE_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Override settings from any key lookup, e.g. a map in tests.
    ///
    /// Keys are `SHARDLINE_SHARDS_STATIC`, `SHARDLINE_SHARDS_TOTAL_COUNT`,
    /// `SHARDLINE_SHARDS_ASSIGNED` (comma separated) and
    /// `SHARDLINE_PROCESSORS_<FIELD>` for every processor field.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |section: &str, field: &str| {
            let key = format!("{}_{}_{}", ENV_PREFIX, section, field);
            lookup(&key).map(|value| (key, value))
        };

        if let Some(v) = var("SHARDS", "STATIC") {
            self.shards.is_static = parse_env(v)?;
        }
        if let Some(v) = var("SHARDS", "TOTAL_COUNT") {
            self.shards.total_count = Some(parse_env(v)?);
        }
        if let Some((key, value)) = var("SHARDS", "ASSIGNED") {
            let assigned = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_env((key.clone(), s.to_string())))
                .collect::<Result<Vec<i64>, _>>()?;
            self.shards.assigned = Some(assigned);
        }

        let p = &mut self.processors;
        if let Some(v) = var("PROCESSORS", "ENABLED") {
            p.enabled = parse_env(v)?;
        }
        if let Some(v) = var("PROCESSORS", "POLLING_INTERVAL") {
            p.polling_interval = parse_env(v)?;
        }
        if let Some(v) = var("PROCESSORS", "PULSE_INTERVAL") {
            p.pulse_interval = parse_env(v)?;
        }
        if let Some(v) = var("PROCESSORS", "PULSE_EXPIRATION") {
            p.pulse_expiration = parse_env(v)?;
        }
        if let Some(v) = var("PROCESSORS", "BATCH_SIZE") {
            p.batch_size = parse_env(v)?;
        }
        if let Some(v) = var("PROCESSORS", "TRANSACTION_TIMEOUT") {
            p.transaction_timeout = Some(parse_env(v)?);
        }
        if let Some(v) = var("PROCESSORS", "RETRY_DELAY") {
            p.retry_delay = parse_env(v)?;
        }
        if let Some(v) = var("PROCESSORS", "MAX_CONSECUTIVE_BATCHES") {
            p.max_consecutive_batches = parse_env(v)?;
        }
        if let Some(v) = var("PROCESSORS", "MAX_RETRY_ATTEMPTS") {
            p.max_retry_attempts = Some(parse_env(v)?);
        }

        Ok(())
    }

    /// Check every setting and convert intervals to durations.
    pub fn validate(&self) -> Result<ValidatedSettings, ConfigError> {
        let sharding = self.shards.validate()?;
        let p = &self.processors;

        positive_interval("polling_interval", p.polling_interval)?;
        positive_interval("pulse_interval", p.pulse_interval)?;
        positive_interval("pulse_expiration", p.pulse_expiration)?;
        bounded_interval("retry_delay", p.retry_delay)?;

        if p.pulse_interval < p.polling_interval {
            return Err(ConfigError::InvalidPulseInterval {
                pulse_interval_ms: p.pulse_interval,
                polling_interval_ms: p.polling_interval,
            });
        }
        if p.pulse_expiration < p.pulse_interval.saturating_mul(3) {
            return Err(ConfigError::InvalidPulseExpiration {
                pulse_expiration_ms: p.pulse_expiration,
                pulse_interval_ms: p.pulse_interval,
            });
        }

        positive_count("batch_size", p.batch_size)?;
        positive_count("max_consecutive_batches", p.max_consecutive_batches)?;

        let transaction_timeout = match p.transaction_timeout {
            Some(ms) => {
                positive_interval("transaction_timeout", ms)?;
                Some(Duration::from_millis(ms))
            }
            None => None,
        };

        let retry_policy = match p.max_retry_attempts {
            Some(max_attempts) => {
                positive_count("max_retry_attempts", max_attempts)?;
                RetryPolicy::Bounded { max_attempts }
            }
            None => RetryPolicy::Unbounded,
        };

        Ok(ValidatedSettings {
            sharding,
            polling_interval: Duration::from_millis(p.polling_interval),
            pulse_interval: Duration::from_millis(p.pulse_interval),
            pulse_expiration: Duration::from_millis(p.pulse_expiration),
            batch_size: p.batch_size,
            transaction_timeout,
            retry_delay: Duration::from_millis(p.retry_delay),
            max_consecutive_batches: p.max_consecutive_batches,
            retry_policy,
        })
    }
}

impl ShardSettings {
    fn validate(&self) -> Result<Sharding, ConfigError> {
        if !self.is_static {
            return Ok(Sharding::Dynamic);
        }

        let total_count = self
            .total_count
            .ok_or(ConfigError::MissingStaticShardingProperty("total_count"))?;
        if total_count <= 0 || total_count > u32::MAX as i64 {
            return Err(ConfigError::InvalidTotalShardCount(total_count));
        }

        let assigned = self
            .assigned
            .as_ref()
            .ok_or(ConfigError::MissingStaticShardingProperty("assigned"))?;
        if assigned.is_empty() {
            return Err(ConfigError::MissingStaticShardingProperty("assigned"));
        }

        let mut distinct = BTreeSet::new();
        for &index in assigned {
            if index < 0 || index >= total_count {
                return Err(ConfigError::InvalidShardIndex { index, total_count });
            }
            distinct.insert(index as u32);
        }

        Ok(Sharding::Static {
            total_count: total_count as u32,
            assigned: distinct.into_iter().collect(),
        })
    }
}

fn positive_interval(name: &'static str, value_ms: u64) -> Result<(), ConfigError> {
    if value_ms == 0 {
        return Err(ConfigError::InvalidInterval { name, value_ms });
    }
    bounded_interval(name, value_ms)
}

/// Intervals are added to instants and to i64 epoch milliseconds.
fn bounded_interval(name: &'static str, value_ms: u64) -> Result<(), ConfigError> {
    if value_ms > MAX_INTERVAL_MS {
        return Err(ConfigError::IntervalTooLong {
            name,
            value_ms,
            max_ms: MAX_INTERVAL_MS,
        });
    }
    Ok(())
}

fn positive_count(name: &'static str, value: u32) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidCount { name, value });
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>((key, value): (String, String)) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}

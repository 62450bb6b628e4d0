//! Error types for shardline coordination

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Invalid coordination settings. Always reported before any processor starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("shards.total_count must be a positive integer, got {0}")]
    InvalidTotalShardCount(i64),

    #[error("shards.assigned contains {index}, which is outside [0, {total_count})")]
    InvalidShardIndex { index: i64, total_count: i64 },

    #[error("shards.{0} is required when shards.static is true")]
    MissingStaticShardingProperty(&'static str),

    #[error("processors.{name} must be positive, got {value_ms}ms")]
    InvalidInterval { name: &'static str, value_ms: u64 },

    #[error("processors.{name} must be at most {max_ms}ms, got {value_ms}ms")]
    IntervalTooLong {
        name: &'static str,
        value_ms: u64,
        max_ms: u64,
    },

    #[error(
        "processors.pulse_interval ({pulse_interval_ms}ms) must be greater than or equal to \
         processors.polling_interval ({polling_interval_ms}ms)"
    )]
    InvalidPulseInterval {
        pulse_interval_ms: u64,
        polling_interval_ms: u64,
    },

    #[error(
        "processors.pulse_expiration ({pulse_expiration_ms}ms) must be greater than or equal to \
         3 * processors.pulse_interval ({pulse_interval_ms}ms)"
    )]
    InvalidPulseExpiration {
        pulse_expiration_ms: u64,
        pulse_interval_ms: u64,
    },

    #[error("processors.{name} must be a positive integer, got {value}")]
    InvalidCount { name: &'static str, value: u32 },

    #[error("Failed to read configuration file: {0}")]
    Io(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid value for environment variable {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] shardline_metadata::MetadataError),

    #[error("Sink error: {0}")]
    Sink(#[from] crate::sink::SinkError),

    #[error("Batch processing exceeded the transaction timeout of {0:?}")]
    TransactionTimeout(Duration),

    #[error("Processor {processor} halted after {attempts} failed attempts: {reason}")]
    ProcessorHalted {
        processor: String,
        attempts: u32,
        reason: String,
    },

    #[error("{0} is required")]
    MissingComponent(&'static str),

    #[error("Coordination already started")]
    AlreadyStarted,

    #[error("Scheduler is full ({0} workers)")]
    SchedulerFull(usize),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{} processors failed: {}", .0.len(), join_messages(.0))]
    Multiple(Vec<CoordinationError>),

    #[error("{} errors while stopping: {}", .0.len(), join_messages(.0))]
    Shutdown(Vec<CoordinationError>),
}

fn join_messages(errors: &[CoordinationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

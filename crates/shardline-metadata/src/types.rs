//! Metadata Types
//!
//! Plain data carried between the store and the coordination layer.
//!
//! ## Agents
//!
//! An [`Agent`] row is one coordination participant. Its `expiration` is a lease:
//! the owning node pushes it forward on every pulse, and every other node treats
//! the agent as dead once `expiration < now`. Timestamps are milliseconds since
//! the Unix epoch, as everywhere else in this crate.
//!
//! ## Shards
//!
//! Outbox events are partitioned by the crc32 of their routing key. The 32-bit
//! hash space is split into `total_shard_count` contiguous ranges and shard `i`
//! owns range `i`. Only the hash is persisted; which shard an event belongs to is
//! recomputed from the current shard count, so a rebalance never rewrites rows.

use crate::error::MetadataError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const HASH_SPACE: u64 = 1 << 32;

/// Lifecycle state of an agent as recorded in the agent table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    /// Registered, but not yet allowed to process (assignment not agreed).
    Starting,
    /// Owns its assignment and may process events.
    Running,
    /// Stopped processing after losing its lease.
    Suspended,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Starting => "STARTING",
            AgentState::Running => "RUNNING",
            AgentState::Suspended => "SUSPENDED",
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentState {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(AgentState::Starting),
            "RUNNING" => Ok(AgentState::Running),
            "SUSPENDED" => Ok(AgentState::Suspended),
            other => Err(MetadataError::InvalidData {
                column: "state",
                value: other.to_string(),
            }),
        }
    }
}

/// A persisted cluster membership record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agent {
    /// Store-assigned identifier; later registrations get larger ids.
    pub id: i64,

    /// Role discriminator (e.g., "event-processor")
    pub agent_type: String,

    /// Human-readable label (e.g., "Outbox event processor - 3")
    pub name: String,

    /// Lease expiration (milliseconds since Unix epoch)
    pub expiration: i64,

    pub state: AgentState,

    pub total_shard_count: Option<u32>,

    pub assigned_shard_index: Option<u32>,

    /// Protocol-specific bytes, opaque to the store.
    pub payload: Option<Vec<u8>>,
}

impl Agent {
    /// Whether the lease has lapsed at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiration < now_ms
    }

    /// The recorded assignment, if both shard columns are set.
    pub fn shard_assignment(&self) -> Option<ShardAssignment> {
        match (self.total_shard_count, self.assigned_shard_index) {
            (Some(total), Some(index)) => ShardAssignment::new(total, index),
            _ => None,
        }
    }

    /// Record `assignment` (or clear it) in the shard columns.
    pub fn set_shard_assignment(&mut self, assignment: Option<ShardAssignment>) {
        self.total_shard_count = assignment.map(|a| a.total_shard_count);
        self.assigned_shard_index = assignment.map(|a| a.assigned_shard_index);
    }
}

/// Fields of an agent that does not have an id yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAgent {
    pub agent_type: String,
    pub name: String,
    pub expiration: i64,
    pub state: AgentState,
    pub assignment: Option<ShardAssignment>,
    pub payload: Option<Vec<u8>>,
}

/// Ownership of one shard out of `total_shard_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub total_shard_count: u32,
    pub assigned_shard_index: u32,
}

impl ShardAssignment {
    /// Returns `None` unless `0 <= index < total`.
    pub fn new(total_shard_count: u32, assigned_shard_index: u32) -> Option<Self> {
        (assigned_shard_index < total_shard_count).then_some(Self {
            total_shard_count,
            assigned_shard_index,
        })
    }

    /// Inclusive range of routing hashes owned by this shard.
    ///
    /// Shard `i` of `n` starts at `ceil(i * 2^32 / n)`; the last shard ends at
    /// `u32::MAX`, so the ranges of all shards tile the hash space exactly.
    pub fn hash_range(&self) -> (u32, u32) {
        let n = self.total_shard_count as u64;
        let i = self.assigned_shard_index as u64;
        let lo = range_start(i, n);
        let hi = range_start(i + 1, n) - 1;
        (lo as u32, hi as u32)
    }

    pub fn contains(&self, hash: u32) -> bool {
        shard_index_for(hash, self.total_shard_count) == self.assigned_shard_index
    }
}

impl fmt::Display for ShardAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.assigned_shard_index, self.total_shard_count)
    }
}

fn range_start(index: u64, total: u64) -> u64 {
    (index * HASH_SPACE).div_ceil(total)
}

/// Shard index owning `hash` when the hash space is split into `total` shards.
pub fn shard_index_for(hash: u32, total: u32) -> u32 {
    ((hash as u64 * total as u64) >> 32) as u32
}

/// Stable routing hash of an event key.
pub fn routing_hash(routing_key: &str) -> u32 {
    crc32fast::hash(routing_key.as_bytes())
}

/// A pending row of the outbox table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEvent {
    /// Enqueue order
    pub id: i64,
    pub routing_key: String,
    pub routing_hash: u32,
    pub payload: Vec<u8>,
    /// Enqueue time (milliseconds since Unix epoch)
    pub created_at: i64,
}

/// An event about to be enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEvent {
    pub routing_key: String,
    pub payload: Vec<u8>,
}

impl NewOutboxEvent {
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload: payload.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_state_round_trip_through_column_text() {
        for state in [AgentState::Starting, AgentState::Running, AgentState::Suspended] {
            assert_eq!(state.as_str().parse::<AgentState>().unwrap(), state);
        }
        assert!("PAUSED".parse::<AgentState>().is_err());
    }

    #[test]
    fn test_shard_assignment_rejects_out_of_range_index() {
        assert!(ShardAssignment::new(3, 2).is_some());
        assert!(ShardAssignment::new(3, 3).is_none());
        assert!(ShardAssignment::new(0, 0).is_none());
    }

    #[test]
    fn test_hash_ranges_tile_the_hash_space() {
        for total in [1u32, 2, 3, 7, 16] {
            let mut expected_start = 0u64;
            for index in 0..total {
                let (lo, hi) = ShardAssignment::new(total, index).unwrap().hash_range();
                assert_eq!(lo as u64, expected_start);
                assert!(hi >= lo);
                expected_start = hi as u64 + 1;
            }
            assert_eq!(expected_start, HASH_SPACE);
        }
    }

    #[test]
    fn test_contains_agrees_with_hash_range() {
        let total = 3;
        let samples = [0u32, 1, 1_431_655_765, 1_431_655_766, 2_863_311_531, u32::MAX];
        for index in 0..total {
            let assignment = ShardAssignment::new(total, index).unwrap();
            let (lo, hi) = assignment.hash_range();
            for hash in samples {
                assert_eq!(assignment.contains(hash), (lo..=hi).contains(&hash));
            }
        }
    }

    #[test]
    fn test_single_shard_owns_everything() {
        let assignment = ShardAssignment::new(1, 0).unwrap();
        assert_eq!(assignment.hash_range(), (0, u32::MAX));
        assert!(assignment.contains(routing_hash("any-key")));
    }

    #[test]
    fn test_routing_hash_is_stable() {
        assert_eq!(routing_hash("order-42"), routing_hash("order-42"));
        assert_eq!(routing_hash(""), 0);
    }
}

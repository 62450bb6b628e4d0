//! Shardline Coordination
//!
//! Drains the transactional outbox across a cluster of nodes. Each node runs one
//! or more event processors; each processor is backed by an agent record in the
//! shared metadata store and only consumes events whose routing hash falls in
//! its shard.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────── CoordinationStrategy ───────────────────────┐
//! │                                                                     │
//! │  ProcessorScheduler (one worker per local agent)                    │
//! │    ├─ EventProcessor ── ClusterLink ── AgentRepositoryProvider ──┐  │
//! │    │        │                                                    │  │
//! │    │        └── OutboxEventFinder / OutboxStore ── EventSink     │  │
//! │    └─ ...                                                        │  │
//! └──────────────────────────────────────────────────────────────────┼──┘
//!                                                                    ▼
//!                                                   shardline_agent table
//! ```
//!
//! ## Sharding modes
//!
//! - **Dynamic**: every live agent takes one shard. Agents renumber themselves
//!   by id order whenever the live set changes, and only resume once every
//!   peer agrees on the new total.
//! - **Static**: the node is configured with a total count and the indices it
//!   owns. An agent waits while any live peer disagrees on the total or holds
//!   the same index with a lower id.
//!
//! An agent's lease is renewed on every pulse. A processor only consumes events
//! while its agent is RUNNING and the lease is still valid locally.

pub mod clock;
pub mod closer;
pub mod cluster_link;
pub mod config;
pub mod error;
pub mod processor;
pub mod providers;
pub mod scheduler;
pub mod shard_assignment;
pub mod sink;
pub mod strategy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cluster_link::{AgentSnapshot, ClusterLink, ClusterView, EVENT_PROCESSOR_AGENT_TYPE};
pub use config::{
    CoordinationSettings, ProcessorSettings, RetryPolicy, ShardSettings, Sharding,
    ValidatedSettings,
};
pub use error::{ConfigError, CoordinationError, Result};
pub use processor::{EventProcessor, ProcessorHandle, ProcessorState, ProcessorStatsSnapshot};
pub use providers::{AgentRepositoryProvider, OutboxEventFinderProvider, SqliteProviders};
pub use sink::{EventSink, SinkError, TracingSink};
pub use strategy::{CoordinationStrategy, CoordinationStrategyBuilder};

//! Shardline Metadata Store
//!
//! This crate holds the two tables the coordinator shares between nodes:
//!
//! - **Agents**: cluster membership records with a lease (`expiration`), a state
//!   and an optional shard assignment.
//! - **Outbox events**: rows written by the business layer inside its own
//!   transactions and drained, shard by shard, by event processors.
//!
//! There is no other shared state. Nodes coordinate only through committed rows
//! and lease expiration.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  enqueue_in(tx)  ┌──────────────────────┐
//! │   Producer   │ ───────────────► │  shardline_outbox_   │
//! └──────────────┘                  │  event               │
//!                                   └──────────┬───────────┘
//!                                              │ find / delete
//! ┌──────────────┐   pulse          ┌──────────┴───────────┐
//! │ Cluster link │ ◄──────────────► │  shardline_agent     │
//! └──────────────┘                  └──────────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use shardline_metadata::{NewOutboxEvent, OutboxEventFinder, OutboxStore, SqliteMetadataStore};
//!
//! let store = SqliteMetadataStore::new("shardline.db").await?;
//! store.enqueue(NewOutboxEvent::new("order-42", b"created".to_vec())).await?;
//!
//! let batch = store.find_outbox_events(None, 50).await?;
//! let ids: Vec<i64> = batch.iter().map(|e| e.id).collect();
//! store.delete_events(&ids).await?;
//! ```

pub mod error;
pub mod store;
pub mod types;

pub use error::{MetadataError, Result};
pub use store::{SqliteAgentRepository, SqliteMetadataStore};
pub use types::*;

use async_trait::async_trait;

/// Agent record operations bound to one store transaction.
///
/// A repository is obtained from [`SqliteMetadataStore::begin_agent_session`]
/// (or a custom provider) and holds the agent table's write lock until it is
/// committed or dropped. Dropping without [`AgentRepository::commit`] rolls
/// every change back. Pulses of different agents therefore never interleave
/// between their read and their write.
#[async_trait]
pub trait AgentRepository: Send {
    /// All agents of `agent_type`, live or expired, ordered by ascending id.
    async fn find_all_ordered_by_id(&mut self, agent_type: &str) -> Result<Vec<Agent>>;

    /// Insert a new agent and return it with its assigned id.
    async fn create(&mut self, agent: NewAgent) -> Result<Agent>;

    /// Overwrite an existing agent record.
    ///
    /// Returns `false` when the row is gone, which means a peer reclaimed it
    /// after its lease expired.
    async fn update(&mut self, agent: &Agent) -> Result<bool>;

    /// Delete agents by id, returning how many rows were removed.
    async fn delete(&mut self, ids: &[i64]) -> Result<u64>;

    /// Make the changes of this session durable.
    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Selects the next batch of pending events for a shard.
#[async_trait]
pub trait OutboxEventFinder: Send + Sync {
    /// Up to `max_results` events owned by `assignment`, in enqueue order.
    ///
    /// With `assignment = None` every pending event is eligible.
    async fn find_outbox_events(
        &self,
        assignment: Option<&ShardAssignment>,
        max_results: u32,
    ) -> Result<Vec<OutboxEvent>>;
}

/// Writes to the outbox table.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append an event and return its id.
    async fn enqueue(&self, event: NewOutboxEvent) -> Result<i64>;

    /// Delete consumed events in a single transaction.
    ///
    /// Returns the number of rows actually removed, which is smaller than
    /// `ids.len()` if another consumer already deleted some of them.
    async fn delete_events(&self, ids: &[i64]) -> Result<u64>;

    /// Number of events still pending.
    async fn count_events(&self) -> Result<u64>;
}

//! SQLite Metadata Store Implementation
//!
//! Implements [`OutboxEventFinder`] and [`OutboxStore`] on top of a single SQLite
//! database, and hands out transaction-scoped [`SqliteAgentRepository`] sessions.
//!
//! ## Usage
//!
//! ### File-Based
//! ```ignore
//! use shardline_metadata::SqliteMetadataStore;
//!
//! // Creates shardline.db (or opens it if it exists)
//! let store = SqliteMetadataStore::new("shardline.db").await?;
//! ```
//!
//! ### In-Memory (Testing)
//! ```ignore
//! let store = SqliteMetadataStore::new_in_memory().await?;
//! ```
//!
//! ## Implementation Details
//!
//! ### Connection Pool
//! - File databases use a pool of 10 connections in WAL mode with a busy timeout,
//!   so pulses and batch deletes from several agents can interleave.
//! - In-memory databases use exactly one connection that never expires: every
//!   SQLite connection to `:memory:` opens its own private database.
//!
//! ### Migrations
//! - Applied on open via `sqlx::migrate!`.
//!
//! ### Producer Transactions
//! - [`SqliteMetadataStore::enqueue_in`] writes an event on a caller-owned
//!   connection, so the event commits or rolls back with the business change
//!   that produced it.

use crate::{
    error::{MetadataError, Result},
    types::*,
    AgentRepository, OutboxEventFinder, OutboxStore,
};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// SQLite-backed store for agents and outbox events
#[derive(Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    /// Open (or create) a file-backed store and apply migrations
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        debug!(path = %path.as_ref().display(), "Opened SQLite metadata store");

        Ok(Self { pool })
    }

    /// Create in-memory database (for testing)
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Underlying pool, for hosts that open their own business transactions.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a transaction holding the database write lock for agent updates.
    ///
    /// SQLite only takes the write lock when a transaction first writes, so a
    /// no-op update runs first. Concurrent sessions queue
    /// behind each other instead of failing when they upgrade from read to write.
    pub async fn begin_agent_session(&self) -> Result<SqliteAgentRepository> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE shardline_agent SET expiration = expiration WHERE 0 = 1")
            .execute(&mut *tx)
            .await?;

        Ok(SqliteAgentRepository { tx })
    }

    /// Enqueue an event on a caller-owned connection or transaction.
    ///
    /// ```ignore
    /// let mut tx = store.pool().begin().await?;
    /// sqlx::query("UPDATE orders SET status = 'paid' WHERE id = ?")
    ///     .bind(42)
    ///     .execute(&mut *tx)
    ///     .await?;
    /// SqliteMetadataStore::enqueue_in(&mut tx, NewOutboxEvent::new("order-42", payload)).await?;
    /// tx.commit().await?;
    /// ```
    pub async fn enqueue_in(conn: &mut SqliteConnection, event: NewOutboxEvent) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO shardline_outbox_event (routing_key, routing_hash, payload, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&event.routing_key)
        .bind(routing_hash(&event.routing_key) as i64)
        .bind(&event.payload)
        .bind(Self::now_ms())
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Close the connection pool. Further operations fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

fn agent_from_row(row: &SqliteRow) -> Result<Agent> {
    let state: String = row.try_get("state")?;
    Ok(Agent {
        id: row.try_get("id")?,
        agent_type: row.try_get("type")?,
        name: row.try_get("name")?,
        expiration: row.try_get("expiration")?,
        state: state.parse()?,
        total_shard_count: column_u32(row, "total_shard_count")?,
        assigned_shard_index: column_u32(row, "assigned_shard_index")?,
        payload: row.try_get("payload")?,
    })
}

fn column_u32(row: &SqliteRow, column: &'static str) -> Result<Option<u32>> {
    let value: Option<i64> = row.try_get(column)?;
    value
        .map(|v| {
            u32::try_from(v).map_err(|_| MetadataError::InvalidData {
                column,
                value: v.to_string(),
            })
        })
        .transpose()
}

fn event_from_row(row: &SqliteRow) -> Result<OutboxEvent> {
    let hash: i64 = row.try_get("routing_hash")?;
    Ok(OutboxEvent {
        id: row.try_get("id")?,
        routing_key: row.try_get("routing_key")?,
        routing_hash: u32::try_from(hash).map_err(|_| MetadataError::InvalidData {
            column: "routing_hash",
            value: hash.to_string(),
        })?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Agent repository bound to one SQLite write transaction.
pub struct SqliteAgentRepository {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl AgentRepository for SqliteAgentRepository {
    async fn find_all_ordered_by_id(&mut self, agent_type: &str) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, type, name, expiration, state,
                   total_shard_count, assigned_shard_index, payload
            FROM shardline_agent
            WHERE type = ?
            ORDER BY id
            "#,
        )
        .bind(agent_type)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(agent_from_row).collect()
    }

    async fn create(&mut self, agent: NewAgent) -> Result<Agent> {
        let total = agent.assignment.map(|a| a.total_shard_count as i64);
        let index = agent.assignment.map(|a| a.assigned_shard_index as i64);

        let result = sqlx::query(
            r#"
            INSERT INTO shardline_agent (
                type, name, expiration, state,
                total_shard_count, assigned_shard_index, payload
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&agent.agent_type)
        .bind(&agent.name)
        .bind(agent.expiration)
        .bind(agent.state.as_str())
        .bind(total)
        .bind(index)
        .bind(&agent.payload)
        .execute(&mut *self.tx)
        .await?;

        let mut created = Agent {
            id: result.last_insert_rowid(),
            agent_type: agent.agent_type,
            name: agent.name,
            expiration: agent.expiration,
            state: agent.state,
            total_shard_count: None,
            assigned_shard_index: None,
            payload: agent.payload,
        };
        created.set_shard_assignment(agent.assignment);

        Ok(created)
    }

    async fn update(&mut self, agent: &Agent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE shardline_agent
            SET name = ?, expiration = ?, state = ?,
                total_shard_count = ?, assigned_shard_index = ?, payload = ?
            WHERE id = ? AND type = ?
            "#,
        )
        .bind(&agent.name)
        .bind(agent.expiration)
        .bind(agent.state.as_str())
        .bind(agent.total_shard_count.map(i64::from))
        .bind(agent.assigned_shard_index.map(i64::from))
        .bind(&agent.payload)
        .bind(agent.id)
        .bind(&agent.agent_type)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&mut self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM shardline_agent WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = query.build().execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxEventFinder for SqliteMetadataStore {
    async fn find_outbox_events(
        &self,
        assignment: Option<&ShardAssignment>,
        max_results: u32,
    ) -> Result<Vec<OutboxEvent>> {
        let rows = match assignment {
            Some(assignment) => {
                let (lo, hi) = assignment.hash_range();
                sqlx::query(
                    r#"
                    SELECT id, routing_key, routing_hash, payload, created_at
                    FROM shardline_outbox_event
                    WHERE routing_hash BETWEEN ? AND ?
                    ORDER BY id
                    LIMIT ?
                    "#,
                )
                .bind(lo as i64)
                .bind(hi as i64)
                .bind(max_results as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, routing_key, routing_hash, payload, created_at
                    FROM shardline_outbox_event
                    ORDER BY id
                    LIMIT ?
                    "#,
                )
                .bind(max_results as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(event_from_row).collect()
    }
}

#[async_trait]
impl OutboxStore for SqliteMetadataStore {
    async fn enqueue(&self, event: NewOutboxEvent) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        Self::enqueue_in(&mut conn, event).await
    }

    async fn delete_events(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;

        let mut query =
            QueryBuilder::<Sqlite>::new("DELETE FROM shardline_outbox_event WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = query.build().execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn count_events(&self) -> Result<u64> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM shardline_outbox_event")
            .fetch_one(&self.pool)
            .await?
            .try_get("count")?;

        Ok(count as u64)
    }
}

//! Pluggable access to the agent table and the outbox.
//!
//! The strategy never talks to a database directly. It asks an
//! [`AgentRepositoryProvider`] for one repository session per pulse, and an
//! [`OutboxEventFinderProvider`] for the finder and store its processors use.
//! Hosts override either provider through the strategy builder. Both default
//! to [`SqliteProviders`].

use async_trait::async_trait;
use shardline_metadata::{
    AgentRepository, MetadataError, OutboxEventFinder, OutboxStore, SqliteMetadataStore,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[async_trait]
pub trait AgentRepositoryProvider: Send + Sync {
    /// Open a repository session. Changes are discarded unless it is committed.
    async fn begin(&self) -> Result<Box<dyn AgentRepository>, MetadataError>;

    /// Release resources held by the provider.
    async fn close(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}

#[async_trait]
pub trait OutboxEventFinderProvider: Send + Sync {
    fn finder(&self) -> Arc<dyn OutboxEventFinder>;

    /// Store used to delete consumed events.
    fn outbox(&self) -> Arc<dyn OutboxStore>;

    async fn close(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}

/// Both providers over one shared [`SqliteMetadataStore`].
///
/// Closing marks the provider closed without closing the pool, which belongs to
/// whoever opened the store (usually the host, which also enqueues events).
///
/// Only new agent sessions are refused after closing. Finder and outbox
/// handles already given out keep working on the shared pool; the strategy
/// aborts the processors holding them before it closes its providers.
pub struct SqliteProviders {
    store: Arc<SqliteMetadataStore>,
    closed: AtomicBool,
}

impl SqliteProviders {
    pub fn new(store: Arc<SqliteMetadataStore>) -> Self {
        Self {
            store,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), MetadataError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MetadataError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl AgentRepositoryProvider for SqliteProviders {
    async fn begin(&self) -> Result<Box<dyn AgentRepository>, MetadataError> {
        self.ensure_open()?;
        let session = self.store.begin_agent_session().await?;
        Ok(Box::new(session))
    }

    async fn close(&self) -> Result<(), MetadataError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl OutboxEventFinderProvider for SqliteProviders {
    fn finder(&self) -> Arc<dyn OutboxEventFinder> {
        self.store.clone()
    }

    fn outbox(&self) -> Arc<dyn OutboxStore> {
        self.store.clone()
    }

    async fn close(&self) -> Result<(), MetadataError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

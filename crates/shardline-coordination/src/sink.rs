//! Destination of drained outbox events.

use async_trait::async_trait;
use shardline_metadata::OutboxEvent;
use thiserror::Error;
use tracing::info;

/// Consumer of outbox batches, e.g. an indexer.
///
/// A batch is applied at least once: if deleting the consumed rows fails after
/// a successful `apply`, the identical batch is applied again. Implementations
/// should be idempotent per event id.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn apply(&self, batch: &[OutboxEvent]) -> Result<(), SinkError>;
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct SinkError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Sink that only logs what it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn apply(&self, batch: &[OutboxEvent]) -> Result<(), SinkError> {
        for event in batch {
            info!(
                event_id = event.id,
                routing_key = %event.routing_key,
                payload_bytes = event.payload.len(),
                "Applied outbox event"
            );
        }
        Ok(())
    }
}

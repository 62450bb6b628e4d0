//! Coordination Strategy - Lifecycle Orchestration
//!
//! Wires one [`ClusterLink`] + [`EventProcessor`] pair per local shard
//! assignment and drives them from the host's lifecycle hooks.
//!
//! ## Lifecycle
//!
//! 1. `start()`: validate settings, register workers on the scheduler, return.
//! 2. `completion()`: resolves once every processor has stopped.
//! 3. `pre_stop()`: processors finish their in-flight batch, leave the cluster,
//!    and stop; resolves when all of them have.
//! 4. `stop()`: aborts the workers, then closes the providers. Every close step
//!    runs even if an earlier one failed.
//!
//! A stopped strategy can be started again. Its providers must still accept
//! sessions; the default [`SqliteProviders`] refuse them once closed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use shardline_coordination::{CoordinationSettings, CoordinationStrategy, TracingSink};
//! use shardline_metadata::SqliteMetadataStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteMetadataStore::new("shardline.db").await?);
//! let strategy = CoordinationStrategy::builder()
//!     .settings(CoordinationSettings::default())
//!     .store(store)
//!     .sink(Arc::new(TracingSink))
//!     .build()?;
//!
//! strategy.start().await?;
//! // ... serve traffic ...
//! strategy.pre_stop().await?;
//! strategy.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::clock::{Clock, SystemClock};
use crate::closer::Closer;
use crate::cluster_link::{AgentSnapshot, ClusterLink, EVENT_PROCESSOR_AGENT_TYPE};
use crate::config::CoordinationSettings;
use crate::error::{CoordinationError, Result};
use crate::processor::{EventProcessor, ProcessorHandle, ProcessorState, ProcessorStatsSnapshot};
use crate::providers::{AgentRepositoryProvider, OutboxEventFinderProvider, SqliteProviders};
use crate::scheduler::ProcessorScheduler;
use crate::shard_assignment::compute_assignments;
use crate::sink::EventSink;
use futures::future::join_all;
use shardline_metadata::{ShardAssignment, SqliteMetadataStore};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

const PROCESSOR_NAME: &str = "Outbox event processor";

struct Running {
    scheduler: ProcessorScheduler,
    stop_tx: watch::Sender<bool>,
    processors: Vec<ProcessorHandle>,
}

pub struct CoordinationStrategy {
    settings: CoordinationSettings,
    agent_repositories: Arc<dyn AgentRepositoryProvider>,
    event_finders: Arc<dyn OutboxEventFinderProvider>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    running: RwLock<Option<Running>>,
}

impl CoordinationStrategy {
    pub fn builder() -> CoordinationStrategyBuilder {
        CoordinationStrategyBuilder::default()
    }

    /// Validate settings and start one worker per local agent. Does not wait for
    /// any agent to reach RUNNING.
    ///
    /// # Errors
    ///
    /// - `Config`: invalid settings; nothing was started
    /// - `AlreadyStarted`: `start()` was already called
    pub async fn start(&self) -> Result<()> {
        if !self.settings.processors.enabled {
            info!("Event processing disabled on this node");
            return Ok(());
        }

        let mut running = self.running.write().await;
        if running.is_some() {
            return Err(CoordinationError::AlreadyStarted);
        }

        let settings = self.settings.validate()?;
        let assignments = compute_assignments(&settings);
        let scheduler = ProcessorScheduler::new(assignments.len());
        let (stop_tx, _) = watch::channel(false);
        let mut processors = Vec::with_capacity(assignments.len());

        for assignment in assignments {
            let name = processor_name(assignment.as_ref());
            let link = ClusterLink::new(
                name.clone(),
                EVENT_PROCESSOR_AGENT_TYPE,
                assignment,
                Arc::clone(&self.agent_repositories),
                Arc::clone(&self.clock),
                settings.pulse_expiration,
            );
            let processor = EventProcessor::new(
                link,
                self.event_finders.finder(),
                self.event_finders.outbox(),
                Arc::clone(&self.sink),
                settings.clone(),
            );

            processors.push(processor.handle());
            scheduler.spawn(name, processor.run(stop_tx.subscribe())).await?;
        }

        info!(
            processors = processors.len(),
            sharding = ?settings.sharding,
            "Started outbox event processing"
        );

        *running = Some(Running {
            scheduler,
            stop_tx,
            processors,
        });

        Ok(())
    }

    /// Resolves when every processor has stopped.
    ///
    /// Fails with `ProcessorHalted` for each processor that gave up on a batch.
    /// Resolves immediately if processing was never started.
    pub async fn completion(&self) -> Result<()> {
        let processors = match self.running.read().await.as_ref() {
            Some(running) => running.processors.clone(),
            None => return Ok(()),
        };

        let states = join_all(processors.iter().map(|p| p.stopped())).await;

        let mut errors: Vec<CoordinationError> = processors
            .iter()
            .zip(states)
            .filter_map(|(processor, state)| match state {
                ProcessorState::Halted { attempts, reason } => {
                    Some(CoordinationError::ProcessorHalted {
                        processor: processor.name.clone(),
                        attempts,
                        reason,
                    })
                }
                _ => None,
            })
            .collect();

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(CoordinationError::Multiple(errors)),
        }
    }

    /// Ask processors to stop after their in-flight batch and wait for them.
    pub async fn pre_stop(&self) -> Result<()> {
        {
            let running = self.running.read().await;
            let Some(running) = running.as_ref() else {
                return Ok(());
            };
            info!(processors = running.processors.len(), "Draining event processors");
            running.stop_tx.send_replace(true);
        }

        self.completion().await
    }

    /// Abort all processors and close owned resources.
    ///
    /// Every step runs even if an earlier one failed; all failures are reported
    /// together as `Shutdown`.
    pub async fn stop(&self) -> Result<()> {
        let mut closer = Closer::new();

        let running = self.running.write().await.take();
        if let Some(running) = running {
            running.stop_tx.send_replace(true);
            closer
                .close("processors", running.scheduler.shutdown_now())
                .await;
        }
        closer
            .close("event finder provider", self.event_finders.close())
            .await;
        closer
            .close("agent repository provider", self.agent_repositories.close())
            .await;

        let result = closer.finish();
        match &result {
            Ok(()) => info!("Coordination stopped"),
            Err(e) => warn!(error = %e, "Coordination stopped with errors"),
        }
        result
    }

    /// Current cluster view of each local agent.
    pub async fn snapshots(&self) -> Vec<(String, AgentSnapshot)> {
        self.handles()
            .await
            .iter()
            .map(|p| (p.name.clone(), p.agent_snapshot()))
            .collect()
    }

    pub async fn stats(&self) -> Vec<(String, ProcessorStatsSnapshot)> {
        self.handles()
            .await
            .iter()
            .map(|p| (p.name.clone(), p.stats()))
            .collect()
    }

    async fn handles(&self) -> Vec<ProcessorHandle> {
        self.running
            .read()
            .await
            .as_ref()
            .map(|r| r.processors.clone())
            .unwrap_or_default()
    }
}

fn processor_name(assignment: Option<&ShardAssignment>) -> String {
    match assignment {
        Some(a) => format!("{} - {}", PROCESSOR_NAME, a.assigned_shard_index),
        None => PROCESSOR_NAME.to_string(),
    }
}

/// Builder for [`CoordinationStrategy`].
///
/// `store` supplies both default providers; either can be replaced.
#[derive(Default)]
pub struct CoordinationStrategyBuilder {
    settings: CoordinationSettings,
    store: Option<Arc<SqliteMetadataStore>>,
    agent_repositories: Option<Arc<dyn AgentRepositoryProvider>>,
    event_finders: Option<Arc<dyn OutboxEventFinderProvider>>,
    sink: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CoordinationStrategyBuilder {
    pub fn settings(mut self, settings: CoordinationSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(mut self, store: Arc<SqliteMetadataStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn agent_repository_provider(mut self, provider: Arc<dyn AgentRepositoryProvider>) -> Self {
        self.agent_repositories = Some(provider);
        self
    }

    pub fn event_finder_provider(mut self, provider: Arc<dyn OutboxEventFinderProvider>) -> Self {
        self.event_finders = Some(provider);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<CoordinationStrategy> {
        let sink = self.sink.ok_or(CoordinationError::MissingComponent("sink"))?;

        let defaults = self.store.map(|store| Arc::new(SqliteProviders::new(store)));
        let agent_repositories = match self.agent_repositories {
            Some(provider) => provider,
            None => defaults
                .clone()
                .map(|p| p as Arc<dyn AgentRepositoryProvider>)
                .ok_or(CoordinationError::MissingComponent("agent repository provider"))?,
        };
        let event_finders = match self.event_finders {
            Some(provider) => provider,
            None => defaults
                .map(|p| p as Arc<dyn OutboxEventFinderProvider>)
                .ok_or(CoordinationError::MissingComponent("event finder provider"))?,
        };

        Ok(CoordinationStrategy {
            settings: self.settings,
            agent_repositories,
            event_finders,
            sink,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            running: RwLock::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShardSettings;
    use crate::sink::TracingSink;

    async fn builder() -> CoordinationStrategyBuilder {
        let store = Arc::new(SqliteMetadataStore::new_in_memory().await.unwrap());
        CoordinationStrategy::builder()
            .store(store)
            .sink(Arc::new(TracingSink))
    }

    #[test]
    fn test_processor_names() {
        assert_eq!(processor_name(None), "Outbox event processor");
        assert_eq!(
            processor_name(ShardAssignment::new(4, 3).as_ref()),
            "Outbox event processor - 3"
        );
    }

    #[tokio::test]
    async fn test_build_requires_sink_and_providers() {
        let err = CoordinationStrategy::builder().build().err().unwrap();
        assert!(matches!(err, CoordinationError::MissingComponent("sink")));

        let err = CoordinationStrategy::builder()
            .sink(Arc::new(TracingSink))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, CoordinationError::MissingComponent(_)));
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_before_starting() {
        let mut settings = CoordinationSettings::default();
        settings.shards = ShardSettings {
            is_static: true,
            total_count: Some(2),
            assigned: Some(vec![0, 2]),
        };
        let strategy = builder().await.settings(settings).build().unwrap();

        let err = strategy.start().await.unwrap_err();
        assert!(matches!(err, CoordinationError::Config(_)));
        assert!(strategy.snapshots().await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_processors_skip_sharding_settings() {
        let mut settings = CoordinationSettings::default();
        settings.processors.enabled = false;
        settings.shards.is_static = true; // missing total_count would fail validation
        let strategy = builder().await.settings(settings).build().unwrap();

        strategy.start().await.unwrap();
        strategy.completion().await.unwrap();
        strategy.pre_stop().await.unwrap();
        strategy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let strategy = builder().await.build().unwrap();
        strategy.start().await.unwrap();
        assert!(matches!(
            strategy.start().await.unwrap_err(),
            CoordinationError::AlreadyStarted
        ));
        strategy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_after_stop_is_allowed() {
        let store = Arc::new(SqliteMetadataStore::new_in_memory().await.unwrap());
        let strategy = CoordinationStrategy::builder()
            .agent_repository_provider(Arc::new(SqliteProviders::new(Arc::clone(&store))))
            .event_finder_provider(Arc::new(SqliteProviders::new(store)))
            .sink(Arc::new(TracingSink))
            .build()
            .unwrap();

        strategy.start().await.unwrap();
        strategy.stop().await.unwrap();
        assert!(strategy.stats().await.is_empty());
        // nothing is running, so completion resolves at once
        strategy.completion().await.unwrap();

        strategy.start().await.unwrap();
        assert_eq!(strategy.stats().await.len(), 1);
        strategy.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_static_start_creates_one_processor_per_index() {
        let mut settings = CoordinationSettings::default();
        settings.shards = ShardSettings {
            is_static: true,
            total_count: Some(3),
            assigned: Some(vec![2, 0, 2]),
        };
        let strategy = builder().await.settings(settings).build().unwrap();
        strategy.start().await.unwrap();

        let names: Vec<String> = strategy.stats().await.into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["Outbox event processor - 0", "Outbox event processor - 2"]
        );

        strategy.pre_stop().await.unwrap();
        strategy.stop().await.unwrap();
    }
}

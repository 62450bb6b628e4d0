//! Event Processor - Outbox Drain Loop
//!
//! One processor runs per local agent. Its worker task interleaves the agent's
//! pulses with poll/apply cycles, so a shard never has two cycles in flight.
//!
//! While the sink applies a batch the worker only renews the lease, on the
//! pulse schedule. The batch is abandoned if the lease deadline passes first,
//! and its rows are deleted only if the agent still owns its shard afterwards.
//! A slow sink therefore never lets a peer take over rows it is applying.
//!
//! ## Cycle
//!
//! ```text
//! IDLE ──► POLLING ──► APPLYING ──┬──► (next batch, up to the fairness cap)
//!   ▲          │                  │
//!   └──(empty)─┘                  └──(failure)──► RETRY_WAIT ──► APPLYING (same batch)
//! ```
//!
//! A failed batch is kept in memory and retried as is after `retry_delay`; it
//! is never re-queried. If the agent's record, state or assignment changed in
//! the meantime, the batch is discarded locally instead (the rows stay in the
//! outbox for the new owner).
//!
//! ## Stopping
//!
//! The stop signal is checked between cycles and between batches. The worker
//! then removes its agent record and ends in STOPPED. Aborting the task instead
//! drops any open store transaction, which rolls it back.

use crate::cluster_link::{AgentSnapshot, ClusterLink};
use crate::config::ValidatedSettings;
use crate::error::CoordinationError;
use crate::sink::EventSink;
use shardline_metadata::{OutboxEvent, OutboxEventFinder, OutboxStore, ShardAssignment};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Observable state of a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Polling,
    Applying,
    RetryWait { attempts: u32 },
    Stopped,
    /// Stopped because a batch exhausted its retry attempts
    Halted { attempts: u32, reason: String },
}

impl ProcessorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessorState::Stopped | ProcessorState::Halted { .. })
    }
}

/// Counters shared between a processor and its observers.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    batches_applied: AtomicU64,
    events_consumed: AtomicU64,
    failed_attempts: AtomicU64,
    discarded_batches: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStatsSnapshot {
    pub batches_applied: u64,
    pub events_consumed: u64,
    pub failed_attempts: u64,
    pub discarded_batches: u64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            batches_applied: self.batches_applied.load(Ordering::Relaxed),
            events_consumed: self.events_consumed.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            discarded_batches: self.discarded_batches.load(Ordering::Relaxed),
        }
    }
}

/// Read side of a running processor.
#[derive(Debug, Clone)]
pub struct ProcessorHandle {
    pub name: String,
    state_rx: watch::Receiver<ProcessorState>,
    snapshot_rx: watch::Receiver<AgentSnapshot>,
    stats: Arc<ProcessorStats>,
}

impl ProcessorHandle {
    pub fn state(&self) -> ProcessorState {
        self.state_rx.borrow().clone()
    }

    pub fn agent_snapshot(&self) -> AgentSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Wait until the processor reaches a terminal state.
    ///
    /// An aborted worker never reports one; its dropped channel counts as STOPPED.
    pub async fn stopped(&self) -> ProcessorState {
        let mut rx = self.state_rx.clone();
        let state = match rx.wait_for(ProcessorState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => ProcessorState::Stopped,
        };
        state
    }
}

struct RetainedBatch {
    events: Vec<OutboxEvent>,
    agent_id: Option<i64>,
    assignment: Option<ShardAssignment>,
    attempts: u32,
}

struct Halt {
    attempts: u32,
    reason: String,
}

enum ApplyOutcome {
    /// Applied and deleted; carries the number of deleted rows
    Applied(u64),
    Failed(CoordinationError),
    /// The lease lapsed or the agent left RUNNING before the rows were deleted
    OwnershipLost,
}

pub struct EventProcessor {
    name: String,
    link: ClusterLink,
    finder: Arc<dyn OutboxEventFinder>,
    outbox: Arc<dyn OutboxStore>,
    sink: Arc<dyn EventSink>,
    settings: ValidatedSettings,
    retained: Option<RetainedBatch>,
    next_pulse: Instant,
    state_tx: watch::Sender<ProcessorState>,
    stats: Arc<ProcessorStats>,
}

impl EventProcessor {
    pub fn new(
        link: ClusterLink,
        finder: Arc<dyn OutboxEventFinder>,
        outbox: Arc<dyn OutboxStore>,
        sink: Arc<dyn EventSink>,
        settings: ValidatedSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(ProcessorState::Idle);
        Self {
            name: link.name().to_string(),
            link,
            finder,
            outbox,
            sink,
            settings,
            retained: None,
            next_pulse: Instant::now(),
            state_tx,
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    pub fn handle(&self) -> ProcessorHandle {
        ProcessorHandle {
            name: self.name.clone(),
            state_rx: self.state_tx.subscribe(),
            snapshot_rx: self.link.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Run until `stop_rx` turns true (or its sender is dropped), then leave the
    /// cluster.
    pub async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        info!(
            processor = %self.name,
            polling_interval_ms = self.settings.polling_interval.as_millis() as u64,
            pulse_interval_ms = self.settings.pulse_interval.as_millis() as u64,
            "Event processor started"
        );

        let mut next_attempt = Instant::now();

        let outcome = loop {
            if *stop_rx.borrow() {
                break Ok(());
            }

            if Instant::now() >= self.next_pulse {
                self.link.pulse().await;
                self.next_pulse = Instant::now() + self.settings.pulse_interval;
            }

            if Instant::now() >= next_attempt {
                match self.run_cycle(&stop_rx).await {
                    Ok(wait) => next_attempt = Instant::now() + wait,
                    Err(halt) => break Err(halt),
                }
            }

            let wake = next_attempt.min(self.next_pulse);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        self.link.leave().await;

        let stats = self.stats.snapshot();
        match outcome {
            Ok(()) => {
                info!(
                    processor = %self.name,
                    batches = stats.batches_applied,
                    events = stats.events_consumed,
                    failures = stats.failed_attempts,
                    "Event processor stopped"
                );
                self.state_tx.send_replace(ProcessorState::Stopped);
            }
            Err(halt) => {
                self.state_tx.send_replace(ProcessorState::Halted {
                    attempts: halt.attempts,
                    reason: halt.reason,
                });
            }
        }
    }

    /// One scheduled cycle. Returns how long to wait before the next one.
    async fn run_cycle(
        &mut self,
        stop_rx: &watch::Receiver<bool>,
    ) -> std::result::Result<Duration, Halt> {
        let snapshot = self.link.snapshot();
        self.discard_if_ownership_changed(&snapshot);

        if !snapshot.can_process(Instant::now()) {
            self.set_state(ProcessorState::Idle);
            return Ok(self.settings.polling_interval);
        }

        let mut batches: u32 = 0;
        loop {
            let batch = match self.retained.take() {
                Some(batch) => batch,
                None => {
                    self.set_state(ProcessorState::Polling);
                    let events = match self
                        .finder
                        .find_outbox_events(snapshot.assignment.as_ref(), self.settings.batch_size)
                        .await
                    {
                        Ok(events) => events,
                        Err(e) => {
                            warn!(processor = %self.name, error = %e, "Failed to poll outbox events");
                            self.set_state(ProcessorState::Idle);
                            return Ok(self.settings.polling_interval);
                        }
                    };

                    if events.is_empty() {
                        self.set_state(ProcessorState::Idle);
                        return Ok(self.settings.polling_interval);
                    }

                    RetainedBatch {
                        events,
                        agent_id: snapshot.agent_id,
                        assignment: snapshot.assignment,
                        attempts: 0,
                    }
                }
            };

            self.set_state(ProcessorState::Applying);
            let full_batch = batch.events.len() as u32 >= self.settings.batch_size;

            match self.apply_and_delete(&batch.events).await {
                ApplyOutcome::Applied(deleted) => {
                    let applied = batch.events.len() as u64;
                    self.stats.batches_applied.fetch_add(1, Ordering::Relaxed);
                    self.stats.events_consumed.fetch_add(applied, Ordering::Relaxed);

                    if deleted < applied {
                        warn!(
                            processor = %self.name,
                            applied,
                            deleted,
                            "Fewer outbox rows deleted than applied; another node may have consumed them"
                        );
                    }
                    debug!(
                        processor = %self.name,
                        events = applied,
                        attempts = batch.attempts + 1,
                        "Batch applied"
                    );
                }
                ApplyOutcome::OwnershipLost => {
                    warn!(
                        processor = %self.name,
                        events = batch.events.len(),
                        state = %self.link.snapshot().state,
                        "Lost shard ownership during a batch; leaving its rows to the next owner"
                    );
                    self.stats.discarded_batches.fetch_add(1, Ordering::Relaxed);
                    self.set_state(ProcessorState::Idle);
                    return Ok(self.settings.polling_interval);
                }
                ApplyOutcome::Failed(e) => {
                    let attempts = batch.attempts + 1;
                    self.stats.failed_attempts.fetch_add(1, Ordering::Relaxed);

                    if self.settings.retry_policy.is_exhausted(attempts) {
                        error!(
                            processor = %self.name,
                            attempts,
                            error = %e,
                            first_event_id = batch.events.first().map(|ev| ev.id),
                            "Batch failed too many times; halting processor"
                        );
                        return Err(Halt {
                            attempts,
                            reason: e.to_string(),
                        });
                    }

                    warn!(
                        processor = %self.name,
                        attempts,
                        error = %e,
                        events = batch.events.len(),
                        "Batch failed; retrying the same batch"
                    );
                    self.retained = Some(RetainedBatch { attempts, ..batch });
                    self.set_state(ProcessorState::RetryWait { attempts });
                    return Ok(self.retry_wait());
                }
            }

            batches += 1;
            if !full_batch {
                self.set_state(ProcessorState::Idle);
                return Ok(self.settings.polling_interval);
            }

            let pulse_due = Instant::now() >= self.next_pulse;
            let capped = batches >= self.settings.max_consecutive_batches;
            let lease_ok = self.link.snapshot().can_process(Instant::now());
            if pulse_due || capped || !lease_ok || *stop_rx.borrow() {
                self.set_state(ProcessorState::Idle);
                return Ok(Duration::ZERO);
            }
        }
    }

    /// Apply a batch, then delete its rows.
    ///
    /// The lease is renewed on schedule while the sink works. The apply is
    /// abandoned once the lease deadline passes or the optional transaction
    /// timeout fires, and rows are only deleted while the agent still owns
    /// its shard.
    async fn apply_and_delete(&mut self, events: &[OutboxEvent]) -> ApplyOutcome {
        let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        let timeout = self.settings.transaction_timeout;
        let timeout_at = timeout.map(|t| Instant::now() + t);
        let sink = Arc::clone(&self.sink);
        let mut apply = sink.apply(events);

        let applied = loop {
            let lease_deadline = match self.link.snapshot() {
                snapshot if snapshot.can_process(Instant::now()) => snapshot.lease_deadline,
                _ => None,
            };
            let Some(lease_deadline) = lease_deadline else {
                return ApplyOutcome::OwnershipLost;
            };

            tokio::select! {
                result = &mut apply => break result,
                _ = tokio::time::sleep_until(self.next_pulse) => {
                    self.link.renew().await;
                    self.next_pulse = Instant::now() + self.settings.pulse_interval;
                }
                _ = tokio::time::sleep_until(lease_deadline) => {
                    return ApplyOutcome::OwnershipLost;
                }
                _ = tokio::time::sleep_until(timeout_at.unwrap_or(lease_deadline)), if timeout_at.is_some() => {
                    return ApplyOutcome::Failed(CoordinationError::TransactionTimeout(
                        timeout.unwrap_or_default(),
                    ));
                }
            }
        };

        if let Err(e) = applied {
            return ApplyOutcome::Failed(e.into());
        }
        if !self.link.snapshot().can_process(Instant::now()) {
            return ApplyOutcome::OwnershipLost;
        }

        let delete = self.outbox.delete_events(&ids);
        let deleted = match timeout_at {
            Some(at) => match tokio::time::timeout_at(at, delete).await {
                Ok(result) => result,
                Err(_) => {
                    return ApplyOutcome::Failed(CoordinationError::TransactionTimeout(
                        timeout.unwrap_or_default(),
                    ))
                }
            },
            None => delete.await,
        };

        match deleted {
            Ok(count) => ApplyOutcome::Applied(count),
            Err(e) => ApplyOutcome::Failed(e.into()),
        }
    }

    fn discard_if_ownership_changed(&mut self, snapshot: &AgentSnapshot) {
        let Some(batch) = &self.retained else {
            return;
        };

        let still_owned = snapshot.can_process(Instant::now())
            && snapshot.agent_id == batch.agent_id
            && snapshot.assignment == batch.assignment;
        if still_owned {
            return;
        }

        warn!(
            processor = %self.name,
            events = batch.events.len(),
            attempts = batch.attempts,
            state = %snapshot.state,
            "Shard ownership changed; dropping retained batch"
        );
        self.stats.discarded_batches.fetch_add(1, Ordering::Relaxed);
        self.retained = None;
    }

    /// A zero delay retries on the next polling tick rather than spinning.
    fn retry_wait(&self) -> Duration {
        if self.settings.retry_delay.is_zero() {
            self.settings.polling_interval
        } else {
            self.settings.retry_delay
        }
    }

    fn set_state(&self, state: ProcessorState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::cluster_link::EVENT_PROCESSOR_AGENT_TYPE;
    use crate::config::{CoordinationSettings, RetryPolicy};
    use crate::providers::SqliteProviders;
    use crate::sink::SinkError;
    use async_trait::async_trait;
    use shardline_metadata::{NewOutboxEvent, SqliteMetadataStore};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Fails the first `failures` calls, records every batch it sees.
    #[derive(Default)]
    struct FlakySink {
        failures: Mutex<VecDeque<()>>,
        seen: Mutex<Vec<Vec<OutboxEvent>>>,
    }

    impl FlakySink {
        fn failing(times: usize) -> Self {
            Self {
                failures: Mutex::new((0..times).map(|_| ()).collect()),
                seen: Mutex::default(),
            }
        }

        fn seen(&self) -> Vec<Vec<OutboxEvent>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for FlakySink {
        async fn apply(&self, batch: &[OutboxEvent]) -> std::result::Result<(), SinkError> {
            self.seen.lock().unwrap().push(batch.to_vec());
            match self.failures.lock().unwrap().pop_front() {
                Some(()) => Err(SinkError::new("index unavailable")),
                None => Ok(()),
            }
        }
    }

    /// Sleeps through every batch, optionally jumping a manual clock first.
    struct SlowSink {
        delay: Duration,
        clock_jump: Option<(Arc<ManualClock>, i64)>,
        calls: AtomicU64,
    }

    impl SlowSink {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                clock_jump: None,
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl EventSink for SlowSink {
        async fn apply(&self, _batch: &[OutboxEvent]) -> std::result::Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((clock, ms)) = &self.clock_jump {
                clock.advance_ms(*ms);
            }
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn settings(batch_size: u32, max_retry_attempts: Option<u32>) -> ValidatedSettings {
        let mut settings = CoordinationSettings::default();
        settings.processors.polling_interval = 10;
        settings.processors.pulse_interval = 50;
        settings.processors.pulse_expiration = 5_000;
        settings.processors.batch_size = batch_size;
        settings.processors.retry_delay = 5;
        settings.processors.max_retry_attempts = max_retry_attempts;
        settings.validate().unwrap()
    }

    async fn processor(
        store: &Arc<SqliteMetadataStore>,
        sink: Arc<dyn EventSink>,
        settings: ValidatedSettings,
    ) -> EventProcessor {
        processor_with_clock(store, sink, settings, Arc::new(SystemClock)).await
    }

    async fn processor_with_clock(
        store: &Arc<SqliteMetadataStore>,
        sink: Arc<dyn EventSink>,
        settings: ValidatedSettings,
        clock: Arc<dyn Clock>,
    ) -> EventProcessor {
        let providers = Arc::new(SqliteProviders::new(Arc::clone(store)));
        let link = ClusterLink::new(
            "Outbox event processor",
            EVENT_PROCESSOR_AGENT_TYPE,
            ShardAssignment::new(1, 0),
            providers,
            clock,
            settings.pulse_expiration,
        );
        let mut processor = EventProcessor::new(link, store.clone(), store.clone(), sink, settings);
        // cycles are driven by hand; keep the pulse schedule out of the way
        processor.next_pulse = Instant::now() + Duration::from_secs(60);
        processor
    }

    async fn enqueue(store: &SqliteMetadataStore, count: usize) {
        for i in 0..count {
            store
                .enqueue(NewOutboxEvent::new(format!("key-{}", i), vec![i as u8]))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_cycle_skipped_until_running() {
        let store = Arc::new(SqliteMetadataStore::new_in_memory().await.unwrap());
        enqueue(&store, 3).await;
        let sink = Arc::new(FlakySink::default());
        let mut processor = processor(&store, sink.clone(), settings(10, None)).await;
        let (_stop_tx, stop_rx) = watch::channel(false);

        // no pulse yet: the agent is not RUNNING
        let wait = processor
            .run_cycle(&stop_rx)
            .await
            .ok()
            .unwrap();
        assert_eq!(wait, Duration::from_millis(10));
        assert!(sink.seen().is_empty());

        processor.link.pulse().await;
        processor
            .run_cycle(&stop_rx)
            .await
            .ok()
            .unwrap();
        assert_eq!(sink.seen().len(), 1);
        assert_eq!(store.count_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_batch_is_retried_identically() {
        let store = Arc::new(SqliteMetadataStore::new_in_memory().await.unwrap());
        enqueue(&store, 4).await;
        let sink = Arc::new(FlakySink::failing(2));
        let mut processor = processor(&store, sink.clone(), settings(3, None)).await;
        let (_stop_tx, stop_rx) = watch::channel(false);
        processor.link.pulse().await;

        assert_eq!(
            processor.run_cycle(&stop_rx).await.ok(),
            Some(Duration::from_millis(5))
        );
        // an event enqueued meanwhile must not leak into the retried batch
        store
            .enqueue(NewOutboxEvent::new("late", b"late".to_vec()))
            .await
            .unwrap();
        processor.run_cycle(&stop_rx).await.ok().unwrap();
        processor.run_cycle(&stop_rx).await.ok().unwrap();

        let seen = sink.seen();
        assert!(seen.len() >= 3);
        assert_eq!(seen[0], seen[1]);
        assert_eq!(seen[1], seen[2]);
        assert_eq!(seen[0].len(), 3);
        assert_eq!(processor.stats.snapshot().failed_attempts, 2);
    }

    #[tokio::test]
    async fn test_bounded_retry_halts() {
        let store = Arc::new(SqliteMetadataStore::new_in_memory().await.unwrap());
        enqueue(&store, 2).await;
        let sink = Arc::new(FlakySink::failing(10));
        let settings = settings(10, Some(2));
        assert_eq!(settings.retry_policy, RetryPolicy::Bounded { max_attempts: 2 });

        let mut processor = processor(&store, sink.clone(), settings).await;
        let (_stop_tx, stop_rx) = watch::channel(false);
        processor.link.pulse().await;

        assert!(processor.run_cycle(&stop_rx).await.is_ok());
        let halt = processor.run_cycle(&stop_rx).await.err().unwrap();
        assert_eq!(halt.attempts, 2);
        assert!(halt.reason.contains("index unavailable"));
        // nothing was dropped from the outbox
        assert_eq!(store.count_events().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_retained_batch_dropped_when_ownership_changes() {
        let store = Arc::new(SqliteMetadataStore::new_in_memory().await.unwrap());
        enqueue(&store, 2).await;
        let sink = Arc::new(FlakySink::failing(1));
        let mut processor = processor(&store, sink.clone(), settings(10, None)).await;
        let (_stop_tx, stop_rx) = watch::channel(false);
        processor.link.pulse().await;

        processor.run_cycle(&stop_rx).await.ok().unwrap();
        assert!(processor.retained.is_some());

        // the record is gone; re-registering yields a new agent id
        processor.link.leave().await;
        processor.link.pulse().await;
        assert_eq!(processor.link.snapshot().state, shardline_metadata::AgentState::Running);
        processor.run_cycle(&stop_rx).await.ok().unwrap();

        assert_eq!(processor.stats.snapshot().discarded_batches, 1);
        // the events were re-polled under the new registration and consumed
        assert_eq!(store.count_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fairness_cap_yields() {
        let store = Arc::new(SqliteMetadataStore::new_in_memory().await.unwrap());
        enqueue(&store, 20).await;
        let sink = Arc::new(FlakySink::default());
        let mut validated = settings(2, None);
        validated.max_consecutive_batches = 3;
        let mut processor = processor(&store, sink.clone(), validated).await;
        let (_stop_tx, stop_rx) = watch::channel(false);
        processor.link.pulse().await;

        let wait = processor
            .run_cycle(&stop_rx)
            .await
            .ok()
            .unwrap();
        assert_eq!(wait, Duration::ZERO);
        assert_eq!(sink.seen().len(), 3);
        assert_eq!(store.count_events().await.unwrap(), 14);
    }

    #[tokio::test]
    async fn test_run_drains_and_stops() {
        let store = Arc::new(SqliteMetadataStore::new_in_memory().await.unwrap());
        enqueue(&store, 25).await;
        let sink = Arc::new(FlakySink::default());
        let mut processor = processor(&store, sink.clone(), settings(4, None)).await;
        processor.next_pulse = Instant::now();
        let handle = processor.handle();
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(processor.run(stop_rx));
        for _ in 0..200 {
            if store.count_events().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.count_events().await.unwrap(), 0);

        stop_tx.send(true).unwrap();
        assert_eq!(handle.stopped().await, ProcessorState::Stopped);
        task.await.unwrap();

        let consumed: Vec<u8> = sink.seen().into_iter().flatten().map(|e| e.payload[0]).collect();
        assert_eq!(consumed, (0..25).collect::<Vec<u8>>());
        assert_eq!(handle.stats().events_consumed, 25);
    }

    #[tokio::test]
    async fn test_lease_renewed_while_slow_sink_applies() {
        let store = Arc::new(SqliteMetadataStore::new_in_memory().await.unwrap());
        enqueue(&store, 3).await;
        let sink = Arc::new(SlowSink::new(Duration::from_millis(400)));

        let mut short = CoordinationSettings::default();
        short.processors.polling_interval = 10;
        short.processors.pulse_interval = 20;
        short.processors.pulse_expiration = 100;
        let mut processor = processor(&store, sink.clone(), short.validate().unwrap()).await;
        let (_stop_tx, stop_rx) = watch::channel(false);
        processor.link.pulse().await;
        processor.next_pulse = Instant::now() + Duration::from_millis(20);

        // the sink outlives the lease several times over
        let started = Instant::now();
        processor.run_cycle(&stop_rx).await.ok().unwrap();

        let snapshot = processor.link.snapshot();
        assert!(snapshot.can_process(Instant::now()));
        assert!(snapshot.lease_deadline.unwrap() > started + Duration::from_millis(400));
        assert_eq!(processor.stats.snapshot().batches_applied, 1);
        assert_eq!(processor.stats.snapshot().discarded_batches, 0);
        assert_eq!(store.count_events().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_kept_in_outbox_when_lease_lost_mid_apply() {
        let store = Arc::new(SqliteMetadataStore::new_in_memory().await.unwrap());
        enqueue(&store, 3).await;
        let clock = Arc::new(ManualClock::new(1_000_000));
        // the record expires while the sink is still working
        let sink = Arc::new(SlowSink {
            clock_jump: Some((clock.clone(), 60_000)),
            ..SlowSink::new(Duration::from_millis(200))
        });

        let mut processor =
            processor_with_clock(&store, sink.clone(), settings(10, None), clock).await;
        let (_stop_tx, stop_rx) = watch::channel(false);
        processor.link.pulse().await;
        processor.next_pulse = Instant::now() + Duration::from_millis(50);

        let wait = processor.run_cycle(&stop_rx).await.ok().unwrap();

        assert_eq!(wait, Duration::from_millis(10));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            processor.link.snapshot().state,
            shardline_metadata::AgentState::Suspended
        );
        let stats = processor.stats.snapshot();
        assert_eq!(stats.batches_applied, 0);
        assert_eq!(stats.failed_attempts, 0);
        assert_eq!(stats.discarded_batches, 1);
        assert!(processor.retained.is_none());
        assert_eq!(store.count_events().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stopped_reports_dropped_worker_as_stopped() {
        let store = Arc::new(SqliteMetadataStore::new_in_memory().await.unwrap());
        let processor = processor(&store, Arc::new(FlakySink::default()), settings(1, None)).await;
        let handle = processor.handle();

        drop(processor);
        assert_eq!(handle.stopped().await, ProcessorState::Stopped);
    }
}

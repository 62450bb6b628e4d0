//! Cluster Link - Pulse Protocol
//!
//! Each local agent owns one `ClusterLink`. On every pulse it reads the agent
//! table, reclaims expired peers, decides its own state and assignment, and
//! renews its lease. All of this happens in one repository session, so pulses
//! of different agents are serialized by the store.
//!
//! ## States
//!
//! ```text
//! STARTING ──(peers agree)──► RUNNING ──(reassignment/conflict)──► STARTING
//!     ▲                          │
//!     └────(re-register)─── SUSPENDED ◄──(lease lost locally)───────┘
//! ```
//!
//! Only a RUNNING agent whose lease deadline has not passed may process events.
//!
//! ## Dynamic Sharding
//!
//! The target assignment is `(live agents, own position among them by id)`.
//! A changed target is first recorded as STARTING. The agent only moves to
//! RUNNING on a later pulse, once every other live agent is either STARTING or
//! RUNNING with the same total. A RUNNING agent that sees a RUNNING peer with a
//! different total drops back to STARTING. Two RUNNING agents therefore never
//! hold the same index of the same total.
//!
//! ## Static Sharding
//!
//! The assignment comes from configuration. The agent stays STARTING while a
//! live peer records a different total, or a lower-id peer claims the same
//! index (a misconfiguration), and logs the conflict.
//!
//! ## Lease Loss
//!
//! A failed pulse is retried on the next interval. If no pulse has succeeded for
//! `pulse_expiration`, measured from the start of the last successful one, peers
//! may already consider this agent dead: the link self-demotes to SUSPENDED. If
//! the own record was reclaimed, the next successful pulse registers a new one.
//!
//! While a batch is being applied the processor calls [`ClusterLink::renew`]
//! instead of pulsing. A renewal only extends the lease, so a slow sink never
//! lets the lease lapse and a rebalance never starts mid-batch.

use crate::clock::Clock;
use crate::error::{CoordinationError, Result};
use crate::providers::AgentRepositoryProvider;
use crate::shard_assignment::dynamic_assignment;
use serde::{Deserialize, Serialize};
use shardline_metadata::{Agent, AgentState, MetadataError, NewAgent, ShardAssignment};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Agent type of outbox event processors.
pub const EVENT_PROCESSOR_AGENT_TYPE: &str = "event-processor";

/// What the rest of the node may know about a local agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSnapshot {
    /// Id of the current agent record; changes when the agent re-registers
    pub agent_id: Option<i64>,
    pub state: AgentState,
    pub assignment: Option<ShardAssignment>,
    /// Local monotonic instant after which the lease may have been lost
    pub lease_deadline: Option<Instant>,
}

impl AgentSnapshot {
    fn initial() -> Self {
        Self {
            agent_id: None,
            state: AgentState::Starting,
            assignment: None,
            lease_deadline: None,
        }
    }

    /// Whether events may be processed at `now`.
    pub fn can_process(&self, now: Instant) -> bool {
        self.state == AgentState::Running && self.lease_deadline.is_some_and(|d| now < d)
    }
}

/// Diagnostic payload stored with each agent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    /// Live agent ids the decision was based on, ascending
    pub agent_ids: Vec<i64>,
    /// Wall-clock time of the pulse (ms)
    pub observed_at: i64,
}

pub struct ClusterLink {
    name: String,
    agent_type: String,
    static_assignment: Option<ShardAssignment>,
    repositories: Arc<dyn AgentRepositoryProvider>,
    clock: Arc<dyn Clock>,
    pulse_expiration: Duration,
    self_id: Option<i64>,
    conflict_reported: bool,
    pulse_count: u64,
    failure_count: u64,
    snapshot_tx: watch::Sender<AgentSnapshot>,
}

impl ClusterLink {
    pub fn new(
        name: impl Into<String>,
        agent_type: impl Into<String>,
        static_assignment: Option<ShardAssignment>,
        repositories: Arc<dyn AgentRepositoryProvider>,
        clock: Arc<dyn Clock>,
        pulse_expiration: Duration,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(AgentSnapshot::initial());
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            static_assignment,
            repositories,
            clock,
            pulse_expiration,
            self_id: None,
            conflict_reported: false,
            pulse_count: 0,
            failure_count: 0,
            snapshot_tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Run one pulse. Failures are logged and leave the previous decision in
    /// place, unless the lease deadline has passed.
    pub async fn pulse(&mut self) -> AgentSnapshot {
        let started = Instant::now();
        let previous = self.snapshot();

        match self.try_pulse(previous.state).await {
            Ok(agent) => {
                self.pulse_count += 1;
                if self.failure_count > 0 {
                    info!(
                        agent = %self.name,
                        agent_id = agent.id,
                        failures = self.failure_count,
                        "Pulse recovered"
                    );
                }
                self.failure_count = 0;

                let next = AgentSnapshot {
                    agent_id: Some(agent.id),
                    state: agent.state,
                    assignment: agent.shard_assignment(),
                    lease_deadline: Some(started + self.pulse_expiration),
                };

                if next.state != previous.state || next.assignment != previous.assignment {
                    info!(
                        agent = %self.name,
                        agent_id = agent.id,
                        from = %previous.state,
                        to = %next.state,
                        assignment = ?next.assignment.map(|a| a.to_string()),
                        "Agent state changed"
                    );
                } else {
                    debug!(
                        agent = %self.name,
                        agent_id = agent.id,
                        state = %next.state,
                        count = self.pulse_count,
                        "Pulse succeeded"
                    );
                }

                self.snapshot_tx.send_replace(next);
            }
            Err(e) => self.record_failure(&e, &previous),
        }

        self.snapshot()
    }

    /// Renew the lease without revisiting state or assignment.
    ///
    /// Used while a batch is in flight: peers keep seeing this agent alive
    /// with its current assignment, so nobody takes over the batch's shard,
    /// and a rebalance waits for the next full pulse. If the own record is
    /// gone or already expired, the agent is suspended at once.
    pub async fn renew(&mut self) -> AgentSnapshot {
        let started = Instant::now();
        let previous = self.snapshot();
        if previous.state == AgentState::Suspended {
            return previous;
        }

        match self.try_renew().await {
            Ok(true) => {
                self.failure_count = 0;
                let deadline = started + self.pulse_expiration;
                self.snapshot_tx.send_modify(|s| s.lease_deadline = Some(deadline));
                debug!(agent = %self.name, agent_id = ?previous.agent_id, "Lease renewed");
            }
            Ok(false) => {
                error!(
                    agent = %self.name,
                    agent_id = ?previous.agent_id,
                    "Agent record expired or was reclaimed; suspending processing"
                );
                self.snapshot_tx.send_modify(|s| s.state = AgentState::Suspended);
            }
            Err(e) => self.record_failure(&e, &previous),
        }

        self.snapshot()
    }

    /// Returns false when the own record no longer holds a live lease.
    async fn try_renew(&mut self) -> Result<bool> {
        let Some(id) = self.self_id else {
            return Ok(false);
        };
        let now = self.clock.now_ms();
        let mut repo = self.repositories.begin().await?;

        let agents = repo.find_all_ordered_by_id(&self.agent_type).await?;
        let Some(mut me) = agents.into_iter().find(|a| a.id == id) else {
            return Ok(false);
        };
        if me.is_expired(now) {
            return Ok(false);
        }

        me.expiration = self.expiration_from(now);
        if !repo.update(&me).await? {
            return Ok(false);
        }
        repo.commit().await?;
        Ok(true)
    }

    fn record_failure(&mut self, e: &CoordinationError, previous: &AgentSnapshot) {
        self.failure_count += 1;
        warn!(
            agent = %self.name,
            error = %e,
            failure_count = self.failure_count,
            "Pulse failed"
        );

        let lease_lost = previous
            .lease_deadline
            .is_some_and(|deadline| Instant::now() >= deadline);
        if lease_lost && previous.state != AgentState::Suspended {
            error!(
                agent = %self.name,
                agent_id = ?previous.agent_id,
                "No successful pulse within the lease expiration; suspending processing"
            );
            self.snapshot_tx.send_modify(|s| s.state = AgentState::Suspended);
        }
    }

    fn expiration_from(&self, now_ms: i64) -> i64 {
        let lease_ms = i64::try_from(self.pulse_expiration.as_millis()).unwrap_or(i64::MAX);
        now_ms.saturating_add(lease_ms)
    }

    async fn try_pulse(&mut self, local_state: AgentState) -> Result<Agent> {
        let now = self.clock.now_ms();
        let expiration = self.expiration_from(now);
        let mut repo = self.repositories.begin().await?;

        let agents = repo.find_all_ordered_by_id(&self.agent_type).await?;
        let (expired, mut live): (Vec<Agent>, Vec<Agent>) =
            agents.into_iter().partition(|a| a.is_expired(now));

        if !expired.is_empty() {
            let ids: Vec<i64> = expired.iter().map(|a| a.id).collect();
            for agent in &expired {
                if Some(agent.id) == self.self_id {
                    warn!(agent = %self.name, agent_id = agent.id, "Own lease expired; re-registering");
                } else {
                    info!(
                        agent = %self.name,
                        peer_id = agent.id,
                        peer = %agent.name,
                        expired_ms_ago = now - agent.expiration,
                        "Reclaiming expired agent"
                    );
                }
            }
            repo.delete(&ids).await?;
        }

        let existing = live.iter().find(|a| Some(a.id) == self.self_id).cloned();
        let mut me = match existing {
            Some(agent) => agent,
            None => {
                if let Some(old_id) = self.self_id {
                    warn!(
                        agent = %self.name,
                        agent_id = old_id,
                        "Agent record was reclaimed by a peer; registering again"
                    );
                }
                let created = repo
                    .create(NewAgent {
                        agent_type: self.agent_type.clone(),
                        name: self.name.clone(),
                        expiration,
                        state: AgentState::Starting,
                        assignment: self.static_assignment,
                        payload: None,
                    })
                    .await?;
                info!(agent = %self.name, agent_id = created.id, "Registered agent");
                self.self_id = Some(created.id);
                live.push(created.clone());
                created
            }
        };

        // A locally suspended agent re-earns RUNNING like a fresh one.
        if local_state == AgentState::Suspended {
            me.state = AgentState::Starting;
        }

        let live_ids: Vec<i64> = live.iter().map(|a| a.id).collect();
        let peers: Vec<&Agent> = live.iter().filter(|a| a.id != me.id).collect();

        me.state = match self.static_assignment {
            None => Self::decide_dynamic(&mut me, &live_ids, &peers),
            Some(assignment) => self.decide_static(&mut me, assignment, &peers),
        };
        me.expiration = expiration;
        me.payload = Some(serde_json::to_vec(&ClusterView {
            agent_ids: live_ids,
            observed_at: now,
        })
        .map_err(MetadataError::from)?);

        if !repo.update(&me).await? {
            // The session should make this impossible; treat it as a lost record.
            self.self_id = None;
            return Err(MetadataError::NotFound(me.id).into());
        }
        repo.commit().await?;

        Ok(me)
    }

    fn decide_dynamic(me: &mut Agent, live_ids: &[i64], peers: &[&Agent]) -> AgentState {
        let target = dynamic_assignment(live_ids, me.id);
        if me.shard_assignment() != target {
            me.set_shard_assignment(target);
            return AgentState::Starting;
        }

        // a running peer must agree on the total and must have given up our index
        let total = target.map(|a| a.total_shard_count);
        let peers_agree = peers.iter().all(|peer| match peer.state {
            AgentState::Running => {
                peer.total_shard_count == total && peer.shard_assignment() != target
            }
            AgentState::Starting | AgentState::Suspended => true,
        });

        if peers_agree {
            AgentState::Running
        } else {
            AgentState::Starting
        }
    }

    fn decide_static(
        &mut self,
        me: &mut Agent,
        assignment: ShardAssignment,
        peers: &[&Agent],
    ) -> AgentState {
        me.set_shard_assignment(Some(assignment));

        let conflict = peers.iter().find(|peer| {
            let other_total = peer
                .total_shard_count
                .is_some_and(|total| total != assignment.total_shard_count);
            let same_index_claimed_earlier =
                peer.id < me.id && peer.shard_assignment() == Some(assignment);
            other_total || same_index_claimed_earlier
        });

        match conflict {
            Some(peer) => {
                if !self.conflict_reported {
                    warn!(
                        agent = %self.name,
                        agent_id = me.id,
                        peer_id = peer.id,
                        peer = %peer.name,
                        peer_assignment = ?peer.shard_assignment().map(|a| a.to_string()),
                        assignment = %assignment,
                        "Conflicting static shard assignment; waiting"
                    );
                    self.conflict_reported = true;
                }
                AgentState::Starting
            }
            None => {
                self.conflict_reported = false;
                AgentState::Running
            }
        }
    }

    /// Remove the own record so peers can rebalance without waiting for expiry.
    pub async fn leave(&mut self) {
        let Some(id) = self.self_id.take() else {
            return;
        };

        let result: Result<()> = async {
            let mut repo = self.repositories.begin().await?;
            repo.delete(&[id]).await?;
            repo.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => info!(agent = %self.name, agent_id = id, "Agent left the cluster"),
            Err(e) => warn!(
                agent = %self.name,
                agent_id = id,
                error = %e,
                "Failed to remove agent record; it will expire"
            ),
        }

        self.snapshot_tx.send_replace(AgentSnapshot {
            agent_id: None,
            state: AgentState::Suspended,
            assignment: None,
            lease_deadline: None,
        });
    }
}

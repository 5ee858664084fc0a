/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The communication-graph rebalancer.
//!
//! The rebalancer observes real inter-actor traffic through a bounded
//! sampling filter ([`traffic`]) and periodically migrates activations
//! toward their communication partners, to reduce cross-host messaging.
//! It never needs (or builds) an exact global communication graph.
//!
//! Rounds run on an independent background task, decoupled from the
//! message hot path, at an adaptive period: idle rounds back off toward
//! the configured maximum, and any round that issues migrations is
//! followed by a mandatory recovery pause so transient traffic cannot
//! induce oscillating migrations. At most one round executes at a time;
//! a tick that lands while a round is still running is dropped.
//!
//! Every migration is advisory and best-effort, routed through the
//! directory (an unregister of the old location followed by a register
//! at the new one, behind the [`RebalanceEnv`] seam). A proposal is
//! rejected, without retry within the round, when the target is
//! mid-call, anchored, already migrating, exceeds its request budget,
//! or the directory's view disagrees with the round's snapshot.
//! Rejections are logged and
//! counted, never escalated: correctness lives in the directory's
//! compare contracts, not here.

pub mod traffic;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ConfigError;
use crate::config::RebalancerConfig;
use crate::membership::HostAddress;
use crate::membership::MembershipVersion;
use crate::reference::ActorIdentity;
use traffic::CommunicationEdge;
use traffic::TrafficSampler;
use traffic::WeightedEdge;

/// The origin of a dispatched message, for sampling purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSource {
    /// Sent by another actor.
    Actor(ActorIdentity),
    /// Sent by an external (non-actor) client. Never counted.
    External,
}

/// The runtime state of an activation, as reported by the hosting
/// runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationState {
    /// Quiescent; migratable.
    #[default]
    Idle,
    /// Currently executing a call.
    MidCall,
    /// A migration of this activation is already in flight.
    Migrating,
}

/// Migration eligibility of one activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ActivationStatus {
    /// The activation's runtime state.
    pub state: ActivationState,
    /// Pinned by explicit placement policy; never migrated, never
    /// counted.
    pub anchored: bool,
}

impl ActivationStatus {
    fn excluded_from_sampling(&self) -> bool {
        self.anchored || self.state == ActivationState::Migrating
    }
}

/// Why a migration proposal was not carried out. Soft and expected; a
/// rejection is counted, logged, and forgotten for the round.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum MigrationRejected {
    /// The activation was executing a call.
    #[error("activation is mid-call")]
    MidCall,
    /// The activation is pinned by placement policy.
    #[error("activation is anchored")]
    Anchored,
    /// Another migration of the activation is in flight.
    #[error("activation is already migrating")]
    AlreadyMigrating,
    /// The directory's view disagrees with the round's snapshot.
    #[error("directory view is stale relative to the proposal")]
    StaleView,
    /// The request exceeded its budget.
    #[error("migration request timed out")]
    Timeout,
}

/// What the rebalancer needs from its surroundings: the directory (for
/// locations and migrations) and the activation runtime (for
/// eligibility). Implementations must keep `status_of` cheap; it runs
/// inline with message dispatch.
#[async_trait]
pub trait RebalanceEnv: Send + Sync {
    /// The membership version migration proposals are fenced against.
    fn membership_version(&self) -> MembershipVersion;

    /// The current host of an activation, if the directory knows one.
    async fn location_of(&self, identity: &ActorIdentity) -> Option<HostAddress>;

    /// The migration eligibility of an activation. Unknown identities
    /// report the default (idle, unanchored) status.
    fn status_of(&self, identity: &ActorIdentity) -> ActivationStatus;

    /// Move an activation to `destination`, fenced at `version`:
    /// unregister the old record and register the new one, gated by the
    /// activation's runtime state. Best-effort; see
    /// [`MigrationRejected`].
    async fn migrate(
        &self,
        identity: &ActorIdentity,
        destination: HostAddress,
        version: MembershipVersion,
    ) -> Result<(), MigrationRejected>;
}

/// Judges whether the cluster's traffic distribution is acceptably
/// balanced; when satisfied, a round ends without migrating.
pub trait ImbalanceToleranceRule: Send + Sync {
    /// Whether `imbalance` (the cross-host share of sampled traffic
    /// weight, in `[0, 1]`) is tolerable.
    fn is_satisfied(&self, imbalance: f64) -> bool;
}

/// Tolerates cross-host traffic up to a fixed share of the total.
#[derive(Debug, Clone, Copy)]
pub struct DefaultImbalanceRule {
    /// The largest tolerable cross-host share.
    pub tolerance: f64,
}

impl Default for DefaultImbalanceRule {
    fn default() -> Self {
        Self { tolerance: 0.1 }
    }
}

impl ImbalanceToleranceRule for DefaultImbalanceRule {
    fn is_satisfied(&self, imbalance: f64) -> bool {
        imbalance <= self.tolerance
    }
}

/// How a round concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Another round was still running; this tick was dropped.
    Skipped,
    /// The tolerance rule judged the cluster balanced (or there was no
    /// actionable traffic).
    Balanced,
    /// The round walked the cross-host edges and proposed migrations.
    Proposed,
}

/// Ephemeral per-round accounting. Discarded after each round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    /// When the round started.
    pub started_at: Instant,
    /// Edges taken from the snapshot for consideration.
    pub edges_considered: usize,
    /// Snapshot edges dropped because their endpoints co-reside.
    pub co_resident_edges: usize,
    /// Observations dropped by the sampler for capacity.
    pub edges_dropped: u64,
    /// The computed cross-host imbalance share.
    pub imbalance_millis: u64,
    /// Migration requests that were accepted.
    pub migrations_issued: usize,
    /// Migration requests that were rejected.
    pub migrations_rejected: usize,
    /// How the round concluded.
    pub outcome: RoundOutcome,
}

// Memoizing location resolution: each endpoint costs at most one
// directory read per round, on the round's request budget.
async fn resolve_location(
    env: &dyn RebalanceEnv,
    locations: &mut HashMap<ActorIdentity, HostAddress>,
    identity: &ActorIdentity,
    budget: Duration,
) -> Option<HostAddress> {
    if let Some(host) = locations.get(identity) {
        return Some(*host);
    }
    let host = tokio::time::timeout(budget, env.location_of(identity))
        .await
        .ok()??;
    locations.insert(identity.clone(), host);
    Some(host)
}

// Resets the single-flight guard even if the round future is dropped.
struct RoundGuard<'a>(&'a AtomicBool);

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The per-host rebalancer. Create one, feed it every dispatched
/// message via [`record_message`](Self::record_message), and either
/// drive rounds yourself ([`run_round`](Self::run_round)) or spawn the
/// background loop ([`spawn`](Self::spawn)).
pub struct Rebalancer {
    config: RebalancerConfig,
    sampler: TrafficSampler,
    rule: Arc<dyn ImbalanceToleranceRule>,
    env: Arc<dyn RebalanceEnv>,
    in_round: AtomicBool,
}

impl Rebalancer {
    /// Create a rebalancer. Fails eagerly on invalid configuration.
    pub fn new(
        config: RebalancerConfig,
        rule: Arc<dyn ImbalanceToleranceRule>,
        env: Arc<dyn RebalanceEnv>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let sampler = TrafficSampler::new(
            config.max_edge_count,
            config.probabilistic_filtering_max_allowed_error_rate,
            crate::partition::DEFAULT_SEED,
        );
        Ok(Self {
            config,
            sampler,
            rule,
            env,
            in_round: AtomicBool::new(false),
        })
    }

    /// Sample one dispatched message. Inline with dispatch: cheap,
    /// non-blocking, no await.
    pub fn record_message(&self, source: &MessageSource, target: &ActorIdentity) {
        let sender = match source {
            MessageSource::External => return,
            MessageSource::Actor(sender) => sender,
        };
        if sender == target {
            return;
        }
        if self.config.anchoring_filter_enabled
            && (self.env.status_of(sender).excluded_from_sampling()
                || self.env.status_of(target).excluded_from_sampling())
        {
            return;
        }
        self.sampler
            .record(CommunicationEdge::new(sender.clone(), target.clone()));
    }

    /// Execute one rebalancing round. Single-flight: if a round is
    /// already running the call returns immediately with
    /// [`RoundOutcome::Skipped`].
    pub async fn run_round(&self) -> RoundReport {
        let started_at = Instant::now();
        if self
            .in_round
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            return RoundReport {
                started_at,
                edges_considered: 0,
                co_resident_edges: 0,
                edges_dropped: 0,
                imbalance_millis: 0,
                migrations_issued: 0,
                migrations_rejected: 0,
                outcome: RoundOutcome::Skipped,
            };
        }
        let _guard = RoundGuard(&self.in_round);

        let version = self.env.membership_version();
        let snapshot = self
            .sampler
            .snapshot_heaviest(self.config.max_unprocessed_edges);
        let edges_dropped = self.sampler.overflow();
        self.sampler.reset();

        // Resolve each endpoint's location once. Edges with an unknown
        // endpoint carry no actionable signal this round.
        let mut locations: HashMap<ActorIdentity, HostAddress> = HashMap::new();
        let mut total_weight = 0u64;
        let mut cross_weight = 0u64;
        let mut co_resident_edges = 0usize;
        let mut cross: Vec<WeightedEdge> = Vec::new();
        let budget = self.config.migration_timeout;
        for weighted in snapshot {
            let first =
                resolve_location(self.env.as_ref(), &mut locations, weighted.edge.first(), budget)
                    .await;
            let second =
                resolve_location(self.env.as_ref(), &mut locations, weighted.edge.second(), budget)
                    .await;
            let (Some(first), Some(second)) = (first, second) else {
                continue;
            };
            total_weight += weighted.weight;
            if first == second {
                co_resident_edges += 1;
            } else {
                cross_weight += weighted.weight;
                cross.push(weighted);
            }
        }

        let imbalance = if total_weight == 0 {
            0.0
        } else {
            cross_weight as f64 / total_weight as f64
        };
        let edges_considered = cross.len();

        let mut report = RoundReport {
            started_at,
            edges_considered,
            co_resident_edges,
            edges_dropped,
            imbalance_millis: (imbalance * 1000.0) as u64,
            migrations_issued: 0,
            migrations_rejected: 0,
            outcome: RoundOutcome::Balanced,
        };
        if cross.is_empty() || self.rule.is_satisfied(imbalance) {
            tracing::debug!(
                imbalance,
                edges = edges_considered,
                "rebalancing round found cluster balanced"
            );
            return report;
        }
        report.outcome = RoundOutcome::Proposed;

        // Aggregate each endpoint's cross-host weight; the lighter
        // endpoint of each edge is the cheaper one to move.
        let mut aggregate: HashMap<&ActorIdentity, u64> = HashMap::new();
        for weighted in &cross {
            *aggregate.entry(weighted.edge.first()).or_default() += weighted.weight;
            *aggregate.entry(weighted.edge.second()).or_default() += weighted.weight;
        }

        let mut proposed: HashSet<ActorIdentity> = HashSet::new();
        for weighted in &cross {
            if report.migrations_issued >= self.config.max_edge_count {
                break;
            }
            let first = weighted.edge.first();
            let second = weighted.edge.second();
            let (candidate, partner) = if aggregate[first] <= aggregate[second] {
                (first, second)
            } else {
                (second, first)
            };
            if proposed.contains(candidate) || proposed.contains(partner) {
                continue;
            }
            // Anchored actors are never proposed, even if a counting
            // false positive pulled the edge into the snapshot.
            if self.env.status_of(candidate).anchored {
                continue;
            }
            let destination = locations[partner];
            let attempt = tokio::time::timeout(
                self.config.migration_timeout,
                self.env.migrate(candidate, destination, version),
            )
            .await
            .unwrap_or(Err(MigrationRejected::Timeout));
            match attempt {
                Ok(()) => {
                    proposed.insert(candidate.clone());
                    proposed.insert(partner.clone());
                    report.migrations_issued += 1;
                    tracing::debug!(
                        identity = %candidate,
                        destination = %destination,
                        weight = weighted.weight,
                        "migration issued"
                    );
                }
                Err(rejection) => {
                    report.migrations_rejected += 1;
                    tracing::debug!(
                        identity = %candidate,
                        destination = %destination,
                        %rejection,
                        "migration rejected"
                    );
                }
            }
        }

        tracing::info!(
            imbalance,
            edges = report.edges_considered,
            issued = report.migrations_issued,
            rejected = report.migrations_rejected,
            "rebalancing round complete"
        );
        report
    }

    /// Spawn the periodic background loop. The loop sleeps between
    /// rounds at an adaptive period and shuts down deterministically
    /// when the returned handle is stopped.
    pub fn spawn(self: Arc<Self>) -> RebalancerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let min = self.config.min_rebalancing_period;
            let max = self.config.max_rebalancing_period;
            let recovery = self.config.recovery_period;
            let mut delay = min;
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let report = self.run_round().await;
                if report.migrations_issued > 0 {
                    // Let the moved activations settle before judging
                    // the cluster again.
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(recovery) => {}
                    }
                    delay = min;
                } else {
                    delay = (delay * 2).min(max);
                }
            }
            tracing::debug!("rebalancer loop stopped");
        });
        RebalancerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Stops the background loop. Dropping the handle also stops it (the
/// watch sender closes), but without waiting for the task to finish.
pub struct RebalancerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RebalancerHandle {
    /// Signal shutdown and wait for the loop to exit. Any round in
    /// flight finishes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

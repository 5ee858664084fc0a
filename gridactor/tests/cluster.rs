/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Multi-host scenarios against real directory services.
//!
//! The harness runs one [`DirectoryService`] per simulated host and
//! routes every operation to the partition owner the way an activation
//! layer would: resolve the owner from the current view, call it, and
//! re-resolve on `OwnershipChanged`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gridactor::directory::store::DirectoryStore;
use gridactor::directory::store::InMemoryDirectoryStore;
use gridactor::directory::LookupResponse;
use gridactor::membership::HostState;
use gridactor::rebalancer::ActivationStatus;
use gridactor::rebalancer::MigrationRejected;
use gridactor::rebalancer::RebalanceEnv;
use gridactor::ActivationId;
use gridactor::ActivationRecord;
use gridactor::ActorIdentity;
use gridactor::DirectoryError;
use gridactor::DirectoryService;
use gridactor::HostAddress;
use gridactor::InterfaceVersion;
use gridactor::MembershipVersion;
use gridactor::MembershipView;
use gridactor::Partitioner;
use gridactor::RegisterOutcome;

struct SimCluster {
    partitioner: Partitioner,
    services: HashMap<HostAddress, Arc<DirectoryService>>,
}

impl SimCluster {
    fn new(hosts: &[HostAddress]) -> Self {
        Self::with_store(hosts, None)
    }

    fn with_store(hosts: &[HostAddress], store: Option<Arc<dyn DirectoryStore>>) -> Self {
        let partitioner = Partitioner::default();
        let view = MembershipView::active(MembershipVersion(1), hosts.iter().copied());
        let services = hosts
            .iter()
            .map(|host| {
                let service = DirectoryService::new(*host, partitioner, view.clone());
                let service = match &store {
                    Some(store) => service.with_store(Arc::clone(store)),
                    None => service,
                };
                (*host, Arc::new(service))
            })
            .collect();
        Self {
            partitioner,
            services,
        }
    }

    fn service(&self, host: HostAddress) -> &Arc<DirectoryService> {
        &self.services[&host]
    }

    // The owner-resolving client: route to the owner under the caller's
    // current view, as activation-creation logic would.
    fn owner_of(&self, identity: &ActorIdentity, from: HostAddress) -> Arc<DirectoryService> {
        let view = self.service(from).membership_view();
        let owner = self.partitioner.owner_of(identity, &view).unwrap();
        Arc::clone(self.service(owner))
    }

    async fn register_from(
        &self,
        from: HostAddress,
        record: ActivationRecord,
    ) -> Result<RegisterOutcome, DirectoryError> {
        let owner = self.owner_of(&record.identity, from);
        let fence = owner.membership_version();
        owner.register(record, fence).await
    }

    fn lookup_from(
        &self,
        from: HostAddress,
        identity: &ActorIdentity,
    ) -> Result<LookupResponse, DirectoryError> {
        self.owner_of(identity, from).lookup(identity)
    }

    async fn unregister_from(
        &self,
        from: HostAddress,
        identity: &ActorIdentity,
        activation_id: ActivationId,
    ) -> Result<bool, DirectoryError> {
        let owner = self.owner_of(identity, from);
        let fence = owner.membership_version();
        owner.unregister(identity, activation_id, fence).await
    }

    async fn apply_view(&self, view: MembershipView) {
        for service in self.services.values() {
            service.update_view(view.clone()).await.unwrap();
        }
    }
}

fn host(port: u16) -> HostAddress {
    HostAddress::new(format!("10.1.0.1:{}", port).parse().unwrap(), 0)
}

fn record(identity: &ActorIdentity, on: HostAddress) -> ActivationRecord {
    ActivationRecord {
        identity: identity.clone(),
        host: on,
        activation_id: ActivationId::generate(),
        registered_at: MembershipVersion(1),
        interface_version: InterfaceVersion(1),
    }
}

#[tokio::test]
async fn test_three_host_register_conflict_lookup_migrate() {
    let (a, b, c) = (host(1), host(2), host(3));
    let cluster = SimCluster::new(&[a, b, c]);
    let x = ActorIdentity::new("cart", "x");

    // X activates on A.
    let on_a = record(&x, a);
    assert_eq!(
        cluster.register_from(a, on_a.clone()).await.unwrap(),
        RegisterOutcome::Registered
    );

    // A concurrent activation attempt from B loses and learns A's
    // record.
    let on_b = record(&x, b);
    assert_eq!(
        cluster.register_from(b, on_b).await.unwrap(),
        RegisterOutcome::Conflict(on_a.clone())
    );

    // Any host resolves X to A's activation.
    for from in [a, b, c] {
        let response = cluster.lookup_from(from, &x).unwrap();
        assert_eq!(response.record, Some(on_a.clone()));
    }

    // Migrate X to B: unregister the old activation, register the new.
    assert!(cluster
        .unregister_from(b, &x, on_a.activation_id)
        .await
        .unwrap());
    let moved = record(&x, b);
    assert_eq!(
        cluster.register_from(b, moved.clone()).await.unwrap(),
        RegisterOutcome::Registered
    );
    for from in [a, b, c] {
        let response = cluster.lookup_from(from, &x).unwrap();
        assert_eq!(response.record, Some(moved.clone()));
    }
}

#[tokio::test]
async fn test_concurrent_register_has_exactly_one_winner() {
    let hosts: Vec<HostAddress> = (1..=5).map(host).collect();
    let cluster = Arc::new(SimCluster::new(&hosts));
    let identity = ActorIdentity::new("cart", "contested");

    let mut attempts = Vec::new();
    for from in &hosts {
        let cluster = Arc::clone(&cluster);
        let identity = identity.clone();
        let from = *from;
        attempts.push(tokio::spawn(async move {
            let tentative = record(&identity, from);
            cluster.register_from(from, tentative).await.unwrap()
        }));
    }

    let mut wins = 0;
    let mut conflicts = Vec::new();
    for attempt in attempts {
        match attempt.await.unwrap() {
            RegisterOutcome::Registered => wins += 1,
            RegisterOutcome::Conflict(existing) => conflicts.push(existing),
        }
    }
    assert_eq!(wins, 1, "exactly one registration must win");
    assert_eq!(conflicts.len(), hosts.len() - 1);

    // Every loser learned the same winner, which is what lookup serves.
    let authoritative = cluster.lookup_from(hosts[0], &identity).unwrap().record.unwrap();
    for existing in conflicts {
        assert_eq!(existing, authoritative);
    }
}

#[tokio::test]
async fn test_stale_fence_rejected_after_membership_change() {
    let (a, b) = (host(1), host(2));
    let cluster = SimCluster::new(&[a, b]);
    let identity = ActorIdentity::new("cart", "fenced");

    let owner = cluster.owner_of(&identity, a);
    let old_fence = owner.membership_version();

    // Membership moves on; every service learns the new view.
    let view2 = MembershipView::new(
        MembershipVersion(2),
        [(a, HostState::Active), (b, HostState::Draining)]
            .into_iter()
            .collect(),
    );
    cluster.apply_view(view2).await;

    // A write computed against the old view must be rejected, wherever
    // the identity now lives.
    let rec = record(&identity, a);
    for service in cluster.services.values() {
        assert!(matches!(
            service.register(rec.clone(), old_fence).await,
            Err(DirectoryError::OwnershipChanged { .. })
        ));
    }
}

#[tokio::test]
async fn test_rehydration_preserves_lookups_across_handoff() {
    let (a, b) = (host(1), host(2));
    let store: Arc<dyn DirectoryStore> = Arc::new(InMemoryDirectoryStore::new());
    let cluster = SimCluster::with_store(&[a], Some(Arc::clone(&store)));

    let mut registered = Vec::new();
    for i in 0..40 {
        let identity = ActorIdentity::new("ledger", format!("acct-{}", i));
        let rec = record(&identity, a);
        cluster.register_from(a, rec.clone()).await.unwrap();
        registered.push(rec);
    }

    // B joins; a fresh service for it rehydrates from the shared store.
    let view2 = MembershipView::active(MembershipVersion(2), vec![a, b]);
    cluster.apply_view(view2.clone()).await;
    let service_b = DirectoryService::new(
        b,
        Partitioner::default(),
        MembershipView::active(MembershipVersion(1), vec![a]),
    )
    .with_store(Arc::clone(&store));
    let report = service_b.update_view(view2.clone()).await.unwrap();
    assert!(report.rehydrated > 0, "some partitions should move to b");

    let partitioner = Partitioner::default();
    for rec in &registered {
        let owner = partitioner.owner_of(&rec.identity, &view2).unwrap();
        let response = if owner == b {
            service_b.lookup(&rec.identity).unwrap()
        } else {
            cluster.service(a).lookup(&rec.identity).unwrap()
        };
        assert_eq!(response.record.as_ref(), Some(rec));
    }
}

// A RebalanceEnv implemented over the real directory, as the hosting
// runtime would wire it.
struct DirectoryEnv {
    cluster: SimCluster,
    from: HostAddress,
}

#[async_trait]
impl RebalanceEnv for DirectoryEnv {
    fn membership_version(&self) -> MembershipVersion {
        self.cluster.service(self.from).membership_version()
    }

    async fn location_of(&self, identity: &ActorIdentity) -> Option<HostAddress> {
        self.cluster
            .lookup_from(self.from, identity)
            .ok()?
            .record
            .map(|record| record.host)
    }

    fn status_of(&self, _identity: &ActorIdentity) -> ActivationStatus {
        ActivationStatus::default()
    }

    async fn migrate(
        &self,
        identity: &ActorIdentity,
        destination: HostAddress,
        version: MembershipVersion,
    ) -> Result<(), MigrationRejected> {
        let owner = self.cluster.owner_of(identity, self.from);
        if owner.membership_version() != version {
            return Err(MigrationRejected::StaleView);
        }
        let current = owner
            .lookup(identity)
            .ok()
            .and_then(|response| response.record)
            .ok_or(MigrationRejected::StaleView)?;
        if !owner
            .unregister(identity, current.activation_id, version)
            .await
            .map_err(|_| MigrationRejected::StaleView)?
        {
            return Err(MigrationRejected::AlreadyMigrating);
        }
        let moved = ActivationRecord {
            host: destination,
            activation_id: ActivationId::generate(),
            registered_at: version,
            ..current
        };
        match owner.register(moved, version).await {
            Ok(RegisterOutcome::Registered) => Ok(()),
            _ => Err(MigrationRejected::StaleView),
        }
    }
}

#[tokio::test]
async fn test_rebalancer_migration_round_trips_through_directory() {
    use gridactor::config::RebalancerConfig;
    use gridactor::rebalancer::ImbalanceToleranceRule;
    use gridactor::rebalancer::MessageSource;
    use gridactor::rebalancer::Rebalancer;
    use gridactor::rebalancer::RoundOutcome;

    struct NeverTolerant;
    impl ImbalanceToleranceRule for NeverTolerant {
        fn is_satisfied(&self, _imbalance: f64) -> bool {
            false
        }
    }

    let (a, b) = (host(1), host(2));
    let cluster = SimCluster::new(&[a, b]);
    let chatty_pair = (
        ActorIdentity::new("cart", "caller"),
        ActorIdentity::new("cart", "callee"),
    );
    cluster
        .register_from(a, record(&chatty_pair.0, a))
        .await
        .unwrap();
    cluster
        .register_from(a, record(&chatty_pair.1, b))
        .await
        .unwrap();

    let env = Arc::new(DirectoryEnv { cluster, from: a });
    let rebalancer = Rebalancer::new(
        RebalancerConfig::default(),
        Arc::new(NeverTolerant),
        Arc::clone(&env) as Arc<dyn RebalanceEnv>,
    )
    .unwrap();

    let source = MessageSource::Actor(chatty_pair.0.clone());
    for _ in 0..25 {
        rebalancer.record_message(&source, &chatty_pair.1);
    }
    let report = rebalancer.run_round().await;

    assert_eq!(report.outcome, RoundOutcome::Proposed);
    assert_eq!(report.migrations_issued, 1);
    // Both endpoints co-reside now; the directory serves the new
    // location from any host.
    let loc0 = env.location_of(&chatty_pair.0).await.unwrap();
    let loc1 = env.location_of(&chatty_pair.1).await.unwrap();
    assert_eq!(loc0, loc1);
}

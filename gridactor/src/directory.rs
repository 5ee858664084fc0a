/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The partitioned directory service.
//!
//! Each host runs one [`DirectoryService`], authoritative for the
//! identities whose hash falls in the partitions the
//! [`Partitioner`](crate::partition::Partitioner) assigns to it under the
//! current membership view. The service is a pure state-transition
//! machine: it never retries, never blocks a caller on another caller,
//! and resolves every race synchronously.
//!
//! Two compare-style contracts carry all of the correctness weight:
//!
//! * `register` is compare-and-create: the first committed record for an
//!   identity wins; a concurrent loser synchronously receives the
//!   winner's record as a [`RegisterOutcome::Conflict`] and must discard
//!   its tentative activation.
//! * `unregister` is compare-and-delete: it removes a record only if the
//!   stored activation token matches, which makes it idempotent and
//!   makes aborted migrations harmless (a stale deleter cannot remove
//!   its successor's record).
//!
//! Every write carries the [`MembershipVersion`] it was computed
//! against as a fencing token. A write fenced at any other version, or
//! addressed to a host that does not own the identity's partition, is
//! rejected with [`DirectoryError::OwnershipChanged`]; the caller
//! re-resolves ownership from the latest view and retries on its own
//! budget.

pub mod store;

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use serde::Serialize;

use crate::membership::HostAddress;
use crate::membership::MembershipVersion;
use crate::membership::MembershipView;
use crate::partition::PartitionRing;
use crate::partition::Partitioner;
use crate::reference::ActivationId;
use crate::reference::ActorIdentity;
use crate::reference::InterfaceVersion;
use store::DirectoryStore;

/// The default budget for a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// The authoritative location of one activation. Records are replaced
/// (never mutated) on migration and deleted on deactivation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ActivationRecord {
    /// The actor this activation embodies.
    pub identity: ActorIdentity,
    /// The host the activation lives on.
    pub host: HostAddress,
    /// The unique token of this activation.
    pub activation_id: ActivationId,
    /// The membership version at which the record was registered.
    pub registered_at: MembershipVersion,
    /// The interface version the activation serves.
    pub interface_version: InterfaceVersion,
}

/// The outcome of a [`DirectoryService::register`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The caller's record is now authoritative.
    Registered,
    /// Another activation won the race. The caller must discard its
    /// tentative activation and redirect to the returned record.
    Conflict(ActivationRecord),
}

/// A directory read, paired with the membership version it was read at
/// so callers can cache and invalidate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResponse {
    /// The authoritative record, if one exists in this partition.
    pub record: Option<ActivationRecord>,
    /// The membership version the read was served at.
    pub version: MembershipVersion,
}

/// What a membership change did to the local partition map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffReport {
    /// The version of the newly applied view.
    pub version: MembershipVersion,
    /// Entries still owned locally after the change.
    pub retained: usize,
    /// Entries whose partitions moved to other hosts.
    pub dropped: usize,
    /// Entries recovered from the durable store for newly owned ranges.
    pub rehydrated: usize,
}

/// Errors returned by directory operations.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The operation was addressed to a host that does not own the
    /// identity's partition at the current membership version, or
    /// carried a fence computed against a different version. Retryable
    /// after re-resolving ownership from the latest view.
    #[error("ownership of {identity} changed: owner is {owner:?} at {version}")]
    OwnershipChanged {
        /// The identity the operation addressed.
        identity: ActorIdentity,
        /// The current owner, if the view has one.
        owner: Option<HostAddress>,
        /// The membership version the rejection was evaluated at.
        version: MembershipVersion,
    },

    /// An offered membership view does not supersede the current one.
    #[error("stale membership view: current {current}, offered {offered}")]
    StaleMembership {
        /// The version currently applied.
        current: MembershipVersion,
        /// The version offered.
        offered: MembershipVersion,
    },

    /// A store round trip exceeded its budget.
    #[error("directory store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The durable store failed.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

struct ViewState {
    view: Arc<MembershipView>,
    ring: PartitionRing,
}

/// The per-host directory service. See the module documentation for the
/// operation contracts.
pub struct DirectoryService {
    local: HostAddress,
    partitioner: Partitioner,
    state: RwLock<ViewState>,
    entries: DashMap<ActorIdentity, ActivationRecord>,
    store: Option<Arc<dyn DirectoryStore>>,
    store_timeout: Duration,
}

impl DirectoryService {
    /// Create a service for `local` under an initial view, without
    /// durable backing.
    pub fn new(local: HostAddress, partitioner: Partitioner, view: MembershipView) -> Self {
        let ring = partitioner.ring(&view);
        Self {
            local,
            partitioner,
            state: RwLock::new(ViewState {
                view: Arc::new(view),
                ring,
            }),
            entries: DashMap::new(),
            store: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Attach a durable store used for write-through persistence and
    /// post-handoff rehydration.
    pub fn with_store(mut self, store: Arc<dyn DirectoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the per-round-trip store budget.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// The host this service is authoritative for.
    pub fn local_host(&self) -> HostAddress {
        self.local
    }

    /// The membership version currently applied.
    pub fn membership_version(&self) -> MembershipVersion {
        self.state.read().unwrap().view.version()
    }

    /// The membership view currently applied.
    pub fn membership_view(&self) -> Arc<MembershipView> {
        Arc::clone(&self.state.read().unwrap().view)
    }

    /// The number of entries currently held locally.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the local partition map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Fencing: the write must have been computed against the exact view
    // we hold, and we must own the identity's partition under it.
    fn check_write(
        &self,
        identity: &ActorIdentity,
        fence: MembershipVersion,
    ) -> Result<u64, DirectoryError> {
        let state = self.state.read().unwrap();
        let version = state.view.version();
        let hash = self.partitioner.hash_identity(identity);
        let owner = state.ring.owner_of(hash);
        if fence != version || owner != Some(self.local) {
            return Err(DirectoryError::OwnershipChanged {
                identity: identity.clone(),
                owner,
                version,
            });
        }
        Ok(hash)
    }

    fn check_read(&self, identity: &ActorIdentity) -> Result<MembershipVersion, DirectoryError> {
        let state = self.state.read().unwrap();
        let version = state.view.version();
        let hash = self.partitioner.hash_identity(identity);
        let owner = state.ring.owner_of(hash);
        if owner != Some(self.local) {
            return Err(DirectoryError::OwnershipChanged {
                identity: identity.clone(),
                owner,
                version,
            });
        }
        Ok(version)
    }

    /// Atomic compare-and-create of an activation record. The first
    /// committed record wins; re-registering the identical activation is
    /// idempotent.
    pub async fn register(
        &self,
        record: ActivationRecord,
        fence: MembershipVersion,
    ) -> Result<RegisterOutcome, DirectoryError> {
        let hash = self.check_write(&record.identity, fence)?;
        let outcome = match self.entries.entry(record.identity.clone()) {
            Entry::Occupied(existing) if existing.get().activation_id == record.activation_id => {
                RegisterOutcome::Registered
            }
            Entry::Occupied(existing) => RegisterOutcome::Conflict(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                RegisterOutcome::Registered
            }
        };
        if let (RegisterOutcome::Registered, Some(store)) = (&outcome, &self.store) {
            if let Err(err) = self.store_put(store, hash, &record).await {
                // Roll the tentative entry back so a failed write-through
                // is indistinguishable from no write at all.
                self.entries
                    .remove_if(&record.identity, |_, r| r.activation_id == record.activation_id);
                return Err(err);
            }
        }
        if let RegisterOutcome::Registered = outcome {
            tracing::debug!(
                identity = %record.identity,
                activation = %record.activation_id,
                host = %record.host,
                "registered activation"
            );
        }
        Ok(outcome)
    }

    /// Read the authoritative record for an identity. `record: None`
    /// means NotFound; callers cache the response together with its
    /// membership version.
    pub fn lookup(&self, identity: &ActorIdentity) -> Result<LookupResponse, DirectoryError> {
        let version = self.check_read(identity)?;
        Ok(LookupResponse {
            record: self.entries.get(identity).map(|r| r.clone()),
            version,
        })
    }

    /// Compare-and-delete: removes the identity's record only if its
    /// activation token matches. Returns `false` if the record was
    /// already replaced or removed; calling twice returns `true` then
    /// `false`.
    pub async fn unregister(
        &self,
        identity: &ActorIdentity,
        activation_id: ActivationId,
        fence: MembershipVersion,
    ) -> Result<bool, DirectoryError> {
        let hash = self.check_write(identity, fence)?;
        let removed = self
            .entries
            .remove_if(identity, |_, r| r.activation_id == activation_id);
        let Some((_, record)) = removed else {
            return Ok(false);
        };
        if let Some(store) = &self.store {
            if let Err(err) = self.store_delete(store, hash, identity).await {
                // Restore the entry so a failed delete is
                // indistinguishable from no delete at all. Dropping it
                // while the store copy survives would let the next
                // rehydration resurrect the dead activation.
                if let Entry::Vacant(slot) = self.entries.entry(identity.clone()) {
                    slot.insert(record);
                }
                return Err(err);
            }
        }
        tracing::debug!(identity = %identity, activation = %activation_id, "unregistered activation");
        Ok(true)
    }

    /// Batched compare-and-delete. Entries are independent: partial
    /// success is expected and not an error. An entry whose partition is
    /// not owned here yields `false`.
    pub async fn unregister_many(
        &self,
        entries: Vec<(ActorIdentity, ActivationId)>,
        fence: MembershipVersion,
    ) -> Result<Vec<bool>, DirectoryError> {
        let mut results = Vec::with_capacity(entries.len());
        for (identity, activation_id) in entries {
            match self.unregister(&identity, activation_id, fence).await {
                Ok(removed) => results.push(removed),
                Err(DirectoryError::OwnershipChanged { .. }) => {
                    tracing::debug!(identity = %identity, "skipping unowned entry in batch unregister");
                    results.push(false);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(results)
    }

    /// Apply a superseding membership view: reassign partition
    /// ownership, drop entries whose partitions moved away, and (when a
    /// store is attached) rehydrate newly owned ranges. In-flight
    /// operations fenced at the previous version are rejected from this
    /// point on.
    pub async fn update_view(&self, view: MembershipView) -> Result<HandoffReport, DirectoryError> {
        let ring = {
            let mut state = self.state.write().unwrap();
            if !view.supersedes(&state.view) {
                return Err(DirectoryError::StaleMembership {
                    current: state.view.version(),
                    offered: view.version(),
                });
            }
            state.ring = self.partitioner.ring(&view);
            state.view = Arc::new(view);
            state.ring.clone()
        };
        let version = ring.version();

        let mut dropped = 0;
        self.entries.retain(|identity, _| {
            let hash = self.partitioner.hash_identity(identity);
            let owned = ring.owner_of(hash) == Some(self.local);
            if !owned {
                dropped += 1;
            }
            owned
        });

        let mut rehydrated = 0;
        if let Some(store) = &self.store {
            for range in ring.owned_ranges(&self.local) {
                let records = tokio::time::timeout(self.store_timeout, store.scan_range(range))
                    .await
                    .map_err(|_| DirectoryError::Timeout(self.store_timeout))??;
                for record in records {
                    if let Entry::Vacant(slot) = self.entries.entry(record.identity.clone()) {
                        slot.insert(record);
                        rehydrated += 1;
                    }
                }
            }
        }

        let report = HandoffReport {
            version,
            retained: self.entries.len() - rehydrated,
            dropped,
            rehydrated,
        };
        tracing::info!(
            host = %self.local,
            version = %version,
            retained = report.retained,
            dropped = report.dropped,
            rehydrated = report.rehydrated,
            "applied membership view"
        );
        Ok(report)
    }

    async fn store_put(
        &self,
        store: &Arc<dyn DirectoryStore>,
        hash: u64,
        record: &ActivationRecord,
    ) -> Result<(), DirectoryError> {
        tokio::time::timeout(self.store_timeout, store.put(hash, record))
            .await
            .map_err(|_| DirectoryError::Timeout(self.store_timeout))?
            .map_err(DirectoryError::Store)
    }

    async fn store_delete(
        &self,
        store: &Arc<dyn DirectoryStore>,
        hash: u64,
        identity: &ActorIdentity,
    ) -> Result<(), DirectoryError> {
        tokio::time::timeout(self.store_timeout, store.delete(hash, identity))
            .await
            .map_err(|_| DirectoryError::Timeout(self.store_timeout))?
            .map_err(DirectoryError::Store)
    }
}

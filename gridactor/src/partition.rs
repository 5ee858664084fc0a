/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Consistent-hash partitioning of the identity space.
//!
//! Each active host projects a fixed number of virtual points onto a
//! 64-bit hash ring; an identity is owned by the host whose point is the
//! first at or clockwise-after the identity's hash. Ownership is a pure
//! function of (seed, view): every host with the same configuration
//! derives identical assignments from the same membership view, with no
//! coordination.
//!
//! Hashing is seeded `rapidhash`, not the std hasher, because ownership
//! must agree across independently built processes.
//!
//! The ring also yields each host's owned ranges as contiguous hash
//! intervals, which is what lets a new owner rehydrate its partition from
//! a range-scannable store after handoff.

use std::hash::Hash;
use std::hash::Hasher;

use rapidhash::RapidHasher;
use serde::Deserialize;
use serde::Serialize;

use crate::membership::HostAddress;
use crate::membership::MembershipVersion;
use crate::membership::MembershipView;
use crate::reference::ActorIdentity;

/// The default hash seed. All hosts in a cluster must agree on it.
pub const DEFAULT_SEED: u64 = 0x6772_6964_6163_746f; // "gridacto"

/// The default number of virtual points per host. More points smooth the
/// ownership distribution at the cost of a larger ring.
pub const DEFAULT_REPLICAS: u32 = 64;

/// A circular half-open interval `(after, upto]` of the 64-bit hash
/// space. When `after == upto` the range covers the full ring.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct HashRange {
    /// Exclusive lower bound.
    pub after: u64,
    /// Inclusive upper bound.
    pub upto: u64,
}

impl HashRange {
    /// Whether `hash` falls within this range, accounting for wraparound.
    pub fn contains(&self, hash: u64) -> bool {
        if self.after == self.upto {
            // A single-point ring owns everything.
            true
        } else if self.after < self.upto {
            self.after < hash && hash <= self.upto
        } else {
            hash > self.after || hash <= self.upto
        }
    }
}

/// Maps identities to owning hosts under a given membership view.
#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    seed: u64,
    replicas: u32,
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new(DEFAULT_SEED, DEFAULT_REPLICAS)
    }
}

impl Partitioner {
    /// Create a partitioner with the given seed and virtual point count.
    pub fn new(seed: u64, replicas: u32) -> Self {
        assert!(replicas > 0, "replicas must be positive");
        Self { seed, replicas }
    }

    /// The position of an identity on the ring.
    pub fn hash_identity(&self, identity: &ActorIdentity) -> u64 {
        let mut hasher = RapidHasher::new(self.seed);
        identity.hash(&mut hasher);
        hasher.finish()
    }

    /// Build the ring for a view. Only [`Active`](crate::membership::HostState::Active)
    /// hosts take ownership.
    pub fn ring(&self, view: &MembershipView) -> PartitionRing {
        let mut points: Vec<(u64, HostAddress)> = Vec::new();
        for host in view.active_hosts() {
            for replica in 0..self.replicas {
                let mut hasher = RapidHasher::new(self.seed);
                host.hash(&mut hasher);
                hasher.write_u32(replica);
                points.push((hasher.finish(), *host));
            }
        }
        // Ties on the ring are broken by address order so that all hosts
        // agree on the winner.
        points.sort();
        points.dedup_by_key(|(p, _)| *p);
        PartitionRing {
            version: view.version(),
            points,
        }
    }

    /// The owner of an identity under a view. `None` iff the view has no
    /// active host.
    pub fn owner_of(&self, identity: &ActorIdentity, view: &MembershipView) -> Option<HostAddress> {
        self.ring(view).owner_of(self.hash_identity(identity))
    }
}

/// The materialized ring for one membership view.
#[derive(Debug, Clone)]
pub struct PartitionRing {
    version: MembershipVersion,
    points: Vec<(u64, HostAddress)>,
}

impl PartitionRing {
    /// The membership version this ring was built from.
    pub fn version(&self) -> MembershipVersion {
        self.version
    }

    /// The owner of the given ring position, or `None` on an empty ring.
    pub fn owner_of(&self, hash: u64) -> Option<HostAddress> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|(p, _)| *p < hash);
        let (_, host) = self.points[idx % self.points.len()];
        Some(host)
    }

    /// The contiguous ranges owned by `host`, one per virtual point. The
    /// range ending at point `i` begins just after point `i - 1`
    /// (circularly).
    pub fn owned_ranges(&self, host: &HostAddress) -> Vec<HashRange> {
        let n = self.points.len();
        let mut ranges = Vec::new();
        for i in 0..n {
            if self.points[i].1 != *host {
                continue;
            }
            let after = self.points[(i + n - 1) % n].0;
            ranges.push(HashRange {
                after,
                upto: self.points[i].0,
            });
        }
        ranges
    }
}

/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Bounded-memory sampling of inter-actor traffic.
//!
//! Edge counting runs inline with message dispatch, so it must be cheap
//! and must not serialize unrelated messages. The memory bound comes
//! from a blocked counting-Bloom sketch: a fixed array of small blocks
//! of atomic counters, sized once from the configured capacity and
//! false-positive budget. An edge hashes to one block and to `k`
//! counter slots within it, so every probe for an edge touches a few
//! adjacent cache lines; adding increments the probed slots, and the
//! estimate is the minimum of the probed slots.
//!
//! The error is one-sided: an estimate never under-counts, and the
//! probability of materially over-counting a cold edge is bounded by the
//! configured rate. The sketch supports no removal; it is reset at the
//! start of each rebalancing round.
//!
//! On top of the sketch, a bounded exact table retains at most
//! `capacity` distinct edges so a round can snapshot the heaviest ones.
//! Once the table is full, new edges keep accumulating in the sketch but
//! are not admitted until the next reset; the overflow is counted and
//! reported, not silently lost.

use std::hash::Hash;
use std::hash::Hasher;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use rapidhash::RapidHasher;
use serde::Deserialize;
use serde::Serialize;

use crate::reference::ActorIdentity;

/// An unordered pair of communicating actors. Construction normalizes
/// the endpoint order, so `(a, b)` and `(b, a)` are the same edge.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommunicationEdge(ActorIdentity, ActorIdentity);

impl CommunicationEdge {
    /// Create the edge between `a` and `b`. A self-edge carries no
    /// placement signal; callers filter self-sends before counting, and
    /// debug builds assert it.
    pub fn new(a: ActorIdentity, b: ActorIdentity) -> Self {
        debug_assert_ne!(a, b, "self-edges are filtered before counting");
        if a <= b { Self(a, b) } else { Self(b, a) }
    }

    /// The lexically smaller endpoint.
    pub fn first(&self) -> &ActorIdentity {
        &self.0
    }

    /// The lexically larger endpoint.
    pub fn second(&self) -> &ActorIdentity {
        &self.1
    }
}

// Counters per block. A block spans a handful of cache lines; probes
// for one edge stay within it.
const BLOCK_WIDTH: usize = 64;

// Upper bound on probes per edge: 64 hash bits / 6 bits per offset.
const MAX_PROBES: u32 = 10;

// Mixes the base seed into per-probe seeds.
const PROBE_SEED: u64 = 0x9e37_79b9_7f4a_7c15;

/// A blocked counting-Bloom sketch over communication edges.
///
/// Sized for `capacity` distinct edges at false-positive rate `rate`:
/// `k = ceil(log2(1/rate))` probes per edge and `capacity * k / ln 2`
/// counter slots, rounded up to whole blocks with headroom for
/// block-occupancy variance (a blocked filter pays for its cache
/// locality with uneven block loads).
pub struct BlockedBloomCounter {
    slots: Vec<AtomicU32>,
    blocks: usize,
    probes: u32,
    seed: u64,
}

impl BlockedBloomCounter {
    /// Create a sketch for `capacity` edges at error rate `rate`
    /// (strictly between 0 and 1; enforced upstream by
    /// [`RebalancerConfig::validate`](crate::config::RebalancerConfig::validate)).
    pub fn new(capacity: usize, rate: f64, seed: u64) -> Self {
        let probes = ((1.0 / rate).log2().ceil().max(1.0) as u32).min(MAX_PROBES);
        // Blocking loses precision versus a flat filter; 50% headroom
        // keeps the empirical rate within the budget.
        let slots = (capacity as f64) * (probes as f64) / std::f64::consts::LN_2 * 1.5;
        let blocks = ((slots / BLOCK_WIDTH as f64).ceil() as usize).max(1);
        Self {
            slots: (0..blocks * BLOCK_WIDTH).map(|_| AtomicU32::new(0)).collect(),
            blocks,
            probes,
            seed,
        }
    }

    fn block_of(&self, edge: &CommunicationEdge) -> usize {
        let mut hasher = RapidHasher::new(self.seed);
        edge.hash(&mut hasher);
        (hasher.finish() % self.blocks as u64) as usize
    }

    // Slot offsets within the block: consecutive 6-bit runs of one more
    // hash, so each add/query costs exactly two hash computations.
    fn offsets(&self, edge: &CommunicationEdge) -> impl Iterator<Item = usize> + '_ {
        let mut hasher = RapidHasher::new(self.seed.wrapping_add(PROBE_SEED));
        edge.hash(&mut hasher);
        let bits = hasher.finish();
        (0..self.probes).map(move |i| ((bits >> (6 * i)) & 0x3F) as usize)
    }

    /// Fold one observation of `edge` with the given weight into the
    /// sketch; returns the updated estimate. Lock-free.
    pub fn add(&self, edge: &CommunicationEdge, weight: u32) -> u64 {
        let base = self.block_of(edge) * BLOCK_WIDTH;
        let mut estimate = u32::MAX;
        for offset in self.offsets(edge) {
            let slot = &self.slots[base + offset];
            let updated = slot
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    Some(v.saturating_add(weight))
                })
                .unwrap_or(u32::MAX)
                .saturating_add(weight);
            estimate = estimate.min(updated);
        }
        estimate as u64
    }

    /// The approximate cumulative weight of `edge`. Never under-counts;
    /// over-counts with probability bounded by the configured rate.
    pub fn estimate(&self, edge: &CommunicationEdge) -> u64 {
        let base = self.block_of(edge) * BLOCK_WIDTH;
        let mut estimate = u32::MAX;
        for offset in self.offsets(edge) {
            estimate = estimate.min(self.slots[base + offset].load(Ordering::Relaxed));
        }
        estimate as u64
    }

    /// Zero every counter. Called at the start of each round.
    pub fn reset(&self) {
        for slot in &self.slots {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

/// A weighted edge observed during the current sampling window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedEdge {
    /// The edge.
    pub edge: CommunicationEdge,
    /// Its accumulated approximate weight.
    pub weight: u64,
}

/// The hot-path sampling structure: a sketch for the memory bound plus a
/// bounded exact table for heaviest-edge snapshots.
pub struct TrafficSampler {
    sketch: BlockedBloomCounter,
    hot: DashMap<CommunicationEdge, u64>,
    capacity: usize,
    overflow: AtomicU64,
}

impl TrafficSampler {
    /// Create a sampler for `capacity` tracked edges at the given
    /// sketch error rate.
    pub fn new(capacity: usize, rate: f64, seed: u64) -> Self {
        Self {
            sketch: BlockedBloomCounter::new(capacity, rate, seed),
            hot: DashMap::new(),
            capacity,
            overflow: AtomicU64::new(0),
        }
    }

    /// Record one message crossing `edge`. Cheap and non-blocking; runs
    /// inline with message dispatch.
    pub fn record(&self, edge: CommunicationEdge) {
        let estimate = self.sketch.add(&edge, 1);
        if let Some(mut weight) = self.hot.get_mut(&edge) {
            *weight += 1;
            return;
        }
        if self.hot.len() < self.capacity {
            // The sketch estimate carries weight accumulated before this
            // edge earned a table slot (including any bounded
            // over-count from colliding cold edges).
            self.hot.insert(edge, estimate);
        } else {
            self.overflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The heaviest observed edges, descending by weight, at most
    /// `limit` of them.
    pub fn snapshot_heaviest(&self, limit: usize) -> Vec<WeightedEdge> {
        let mut edges: Vec<WeightedEdge> = self
            .hot
            .iter()
            .map(|entry| WeightedEdge {
                edge: entry.key().clone(),
                weight: *entry.value(),
            })
            .collect();
        edges.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.edge.cmp(&b.edge)));
        edges.truncate(limit);
        edges
    }

    /// Observations dropped because the exact table was full.
    pub fn overflow(&self) -> u64 {
        self.overflow.swap(0, Ordering::Relaxed)
    }

    /// Clear all sampling state. Called at the start of each round.
    pub fn reset(&self) {
        self.sketch.reset();
        self.hot.clear();
        self.overflow.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(a: u32, b: u32) -> CommunicationEdge {
        CommunicationEdge::new(
            ActorIdentity::new("cart", format!("user-{}", a)),
            ActorIdentity::new("cart", format!("user-{}", b)),
        )
    }

    #[test]
    fn test_edges_are_unordered() {
        let ab = CommunicationEdge::new(
            ActorIdentity::new("cart", "a"),
            ActorIdentity::new("cart", "b"),
        );
        let ba = CommunicationEdge::new(
            ActorIdentity::new("cart", "b"),
            ActorIdentity::new("cart", "a"),
        );
        assert_eq!(ab, ba);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "self-edges")]
    fn test_self_edge_asserts_in_debug() {
        let a = ActorIdentity::new("cart", "a");
        let _ = CommunicationEdge::new(a.clone(), a);
    }

    #[test]
    fn test_estimate_never_undercounts() {
        let sketch = BlockedBloomCounter::new(1000, 0.01, 7);
        for i in 0..500 {
            let e = edge(i, i + 1000);
            for _ in 0..(i % 7 + 1) {
                sketch.add(&e, 1);
            }
        }
        for i in 0..500 {
            let e = edge(i, i + 1000);
            assert!(
                sketch.estimate(&e) >= (i % 7 + 1) as u64,
                "edge {} undercounted",
                i
            );
        }
    }

    #[test]
    fn test_false_positive_rate_within_budget() {
        let capacity = 1024;
        let rate = 0.03;
        let sketch = BlockedBloomCounter::new(capacity, rate, 42);
        for i in 0..capacity as u32 {
            sketch.add(&edge(i, i + 100_000), 1);
        }
        let probes = 30_000u32;
        let mut false_positives = 0;
        for i in 0..probes {
            // Disjoint from every inserted endpoint.
            if sketch.estimate(&edge(i + 1_000_000, i + 2_000_000)) > 0 {
                false_positives += 1;
            }
        }
        let empirical = false_positives as f64 / probes as f64;
        assert!(
            empirical <= rate * 1.5,
            "empirical false-positive rate {} exceeds budget {}",
            empirical,
            rate
        );
    }

    #[test]
    fn test_reset_clears_counts() {
        let sketch = BlockedBloomCounter::new(100, 0.01, 7);
        let e = edge(1, 2);
        sketch.add(&e, 5);
        assert!(sketch.estimate(&e) >= 5);
        sketch.reset();
        assert_eq!(sketch.estimate(&e), 0);
    }

    #[test]
    fn test_snapshot_orders_by_weight() {
        let sampler = TrafficSampler::new(100, 0.01, 7);
        for _ in 0..9 {
            sampler.record(edge(1, 2));
        }
        for _ in 0..3 {
            sampler.record(edge(3, 4));
        }
        sampler.record(edge(5, 6));

        let snapshot = sampler.snapshot_heaviest(2);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].edge, edge(1, 2));
        assert_eq!(snapshot[0].weight, 9);
        assert_eq!(snapshot[1].edge, edge(3, 4));
        assert_eq!(snapshot[1].weight, 3);
    }

    #[test]
    fn test_sampler_bounds_tracked_edges() {
        let sampler = TrafficSampler::new(10, 0.01, 7);
        for i in 0..100 {
            sampler.record(edge(i, i + 1000));
        }
        assert_eq!(sampler.snapshot_heaviest(usize::MAX).len(), 10);
        assert_eq!(sampler.overflow(), 90);
        sampler.reset();
        assert!(sampler.snapshot_heaviest(usize::MAX).is_empty());
    }
}

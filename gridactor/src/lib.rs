/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Gridactor is the placement core of a distributed actor runtime: a
//! cluster of hosts cooperatively runs many addressable, stateful actors,
//! each with a stable logical identity and at most one live instance
//! (an _activation_) cluster-wide at a time.
//!
//! The crate owns three tightly coupled concerns, and nothing else:
//!
//! * **Directory**: a partition-owned, authoritative mapping from actor
//!   identity to its current activation location, fenced by membership
//!   versions so that ownership handoff across cluster changes is never
//!   silently ignored. See [`directory`].
//! * **Version-aware placement**: during rolling upgrades several
//!   implementation versions of an actor type coexist; [`placement`]
//!   resolves which of them may serve a new activation, as a pure
//!   function of the deployed set and a per-type compatibility policy.
//! * **Rebalancing**: [`rebalancer`] samples real inter-actor traffic
//!   with bounded memory (a blocked counting-Bloom sketch) and
//!   periodically migrates activations toward their communication
//!   partners, as a best-effort background optimization routed through
//!   the directory.
//!
//! Wire transport, membership detection, durable storage backends, and
//! the actor execution loop itself are external collaborators: the crate
//! consumes a versioned [`membership::MembershipView`] and exposes trait
//! seams ([`directory::store::DirectoryStore`],
//! [`rebalancer::RebalanceEnv`]) for the rest.
//!
//! | Entity       | Identifier            |
//! |--------------|-----------------------|
//! | Actor        | `tag/key`             |
//! | Host         | `addr#generation`     |
//! | Activation   | opaque unique token   |

#![deny(missing_docs)]

pub mod config;
pub mod directory;
pub mod membership;
pub mod partition;
pub mod placement;
pub mod rebalancer;
pub mod reference;

pub use config::RebalancerConfig;
pub use directory::ActivationRecord;
pub use directory::DirectoryError;
pub use directory::DirectoryService;
pub use directory::RegisterOutcome;
pub use membership::HostAddress;
pub use membership::MembershipVersion;
pub use membership::MembershipView;
pub use partition::Partitioner;
pub use placement::PlacementResolver;
pub use rebalancer::Rebalancer;
pub use reference::ActivationId;
pub use reference::ActorIdentity;
pub use reference::InterfaceVersion;

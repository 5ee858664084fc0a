/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Versioned views of cluster membership.
//!
//! Membership detection (failure suspicion, agreement) is an external
//! collaborator: this crate only consumes its output, an immutable,
//! monotonically versioned snapshot of the active host set. A new view
//! supersedes the previous one wholesale; consumers compare versions and
//! must reject regressions (see
//! [`DirectoryService::update_view`](crate::directory::DirectoryService::update_view)).

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// A counter distinguishing successive incarnations of the same network
/// address. A restarted host rejoins with a higher generation, so records
/// referring to the previous incarnation never match it.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct Generation(pub u64);

/// The address of a cluster member: a network address plus the generation
/// of its current incarnation. Displayed as `addr#generation`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostAddress {
    /// The member's network address.
    pub addr: SocketAddr,
    /// The incarnation of this address.
    pub generation: Generation,
}

impl HostAddress {
    /// Create a host address with the given generation.
    pub fn new(addr: SocketAddr, generation: u64) -> Self {
        Self {
            addr,
            generation: Generation(generation),
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.generation.0)
    }
}

/// Errors that occur while parsing a [`HostAddress`].
#[derive(Debug, thiserror::Error)]
pub enum HostAddressParsingError {
    /// The `addr#generation` separator was missing.
    #[error("invalid host address {0:?}: expected addr#generation")]
    MissingSeparator(String),

    /// The network address did not parse.
    #[error("invalid network address in {0:?}")]
    InvalidAddr(String, #[source] std::net::AddrParseError),

    /// The generation did not parse.
    #[error("invalid generation in {0:?}")]
    InvalidGeneration(String, #[source] std::num::ParseIntError),
}

impl FromStr for HostAddress {
    type Err = HostAddressParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, generation) = s
            .rsplit_once('#')
            .ok_or_else(|| HostAddressParsingError::MissingSeparator(s.to_string()))?;
        let addr = addr
            .parse::<SocketAddr>()
            .map_err(|e| HostAddressParsingError::InvalidAddr(s.to_string(), e))?;
        let generation = generation
            .parse::<u64>()
            .map_err(|e| HostAddressParsingError::InvalidGeneration(s.to_string(), e))?;
        Ok(Self::new(addr, generation))
    }
}

/// The lifecycle state of a member within a view.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostState {
    /// The host is serving and may own directory partitions.
    Active,
    /// The host is leaving; it no longer takes new ownership.
    Draining,
    /// The host is gone; its partitions have been reassigned.
    Dead,
}

/// The version of a membership view. Strictly increasing across views;
/// used as the fencing token on every directory write.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct MembershipVersion(pub u64);

impl MembershipVersion {
    /// The next version after this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for MembershipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// An immutable, versioned snapshot of the agreed host set. Ordered so
/// that every host derives identical partition ownership from the same
/// view.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MembershipView {
    version: MembershipVersion,
    hosts: BTreeMap<HostAddress, HostState>,
}

impl MembershipView {
    /// Create a view at the given version over the given host set.
    pub fn new(version: MembershipVersion, hosts: BTreeMap<HostAddress, HostState>) -> Self {
        Self { version, hosts }
    }

    /// A view over hosts that are all [`HostState::Active`].
    pub fn active(version: MembershipVersion, hosts: impl IntoIterator<Item = HostAddress>) -> Self {
        Self::new(
            version,
            hosts.into_iter().map(|h| (h, HostState::Active)).collect(),
        )
    }

    /// The view's version.
    pub fn version(&self) -> MembershipVersion {
        self.version
    }

    /// All members with their states, in address order.
    pub fn hosts(&self) -> impl Iterator<Item = (&HostAddress, HostState)> {
        self.hosts.iter().map(|(h, s)| (h, *s))
    }

    /// Members that may own directory partitions, in address order.
    pub fn active_hosts(&self) -> impl Iterator<Item = &HostAddress> {
        self.hosts
            .iter()
            .filter(|(_, s)| **s == HostState::Active)
            .map(|(h, _)| h)
    }

    /// The state of the given host in this view, if it is a member.
    pub fn state_of(&self, host: &HostAddress) -> Option<HostState> {
        self.hosts.get(host).copied()
    }

    /// Whether this view supersedes `other`.
    pub fn supersedes(&self, other: &MembershipView) -> bool {
        self.version > other.version
    }
}

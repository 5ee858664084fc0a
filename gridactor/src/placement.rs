/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Version-aware placement resolution.
//!
//! During a rolling upgrade several interface versions of an actor type
//! coexist in the cluster. Given a request's version and the set of
//! deployed versions, the resolver returns the subset eligible to serve a
//! new activation. Resolution is a pure function of (requested,
//! available, policy): no I/O, no side effects, fully deterministic.
//!
//! Compatibility predicates and selection policies are typed strategies
//! registered once at startup under explicit keys; there is no runtime
//! type discovery.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use serde::Deserialize;
use serde::Serialize;

use crate::reference::InterfaceVersion;
use crate::reference::TypeTag;

/// Decides whether a deployed version may serve a requested version.
pub trait CompatibilityDirector: Send + Sync + std::fmt::Debug {
    /// Whether `candidate` is compatible with `requested`.
    fn is_compatible(&self, requested: InterfaceVersion, candidate: InterfaceVersion) -> bool;
}

/// Any version at or above the requested one may serve it. The usual
/// policy for additively evolved interfaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackwardCompatible;

impl CompatibilityDirector for BackwardCompatible {
    fn is_compatible(&self, requested: InterfaceVersion, candidate: InterfaceVersion) -> bool {
        candidate >= requested
    }
}

/// Only the exact requested version may serve it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactVersion;

impl CompatibilityDirector for ExactVersion {
    fn is_compatible(&self, requested: InterfaceVersion, candidate: InterfaceVersion) -> bool {
        candidate == requested
    }
}

/// How to narrow the compatible set to the versions actually used for a
/// new activation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelectorPolicy {
    /// Every compatible version is eligible.
    AllCompatible,
    /// Only the newest compatible version; typical during forward
    /// rollout.
    Latest,
    /// Only the oldest compatible version; the conservative choice
    /// during rollback safety windows.
    Minimum,
}

/// The compatible subset of `available` for `requested`, narrowed by
/// `policy`, in ascending order. An empty result is a valid outcome and
/// is the caller's to interpret.
pub fn suitable_versions(
    requested: InterfaceVersion,
    available: &BTreeSet<InterfaceVersion>,
    director: &dyn CompatibilityDirector,
    policy: VersionSelectorPolicy,
) -> Vec<InterfaceVersion> {
    let compatible: Vec<InterfaceVersion> = available
        .iter()
        .copied()
        .filter(|candidate| director.is_compatible(requested, *candidate))
        .collect();
    match policy {
        VersionSelectorPolicy::AllCompatible => compatible,
        VersionSelectorPolicy::Latest => compatible.last().copied().into_iter().collect(),
        VersionSelectorPolicy::Minimum => compatible.first().copied().into_iter().collect(),
    }
}

/// Maps compatibility policy keys to their implementations. Populated
/// once at startup.
#[derive(Debug, Clone, Default)]
pub struct CompatibilityRegistry {
    directors: HashMap<String, Arc<dyn CompatibilityDirector>>,
}

impl CompatibilityRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in directors,
    /// `backward-compatible` and `exact`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("backward-compatible", Arc::new(BackwardCompatible));
        registry.register("exact", Arc::new(ExactVersion));
        registry
    }

    /// Register a director under `key`, replacing any previous binding.
    pub fn register(&mut self, key: impl Into<String>, director: Arc<dyn CompatibilityDirector>) {
        self.directors.insert(key.into(), director);
    }

    /// Resolve the director bound to `key`.
    pub fn resolve(&self, key: &str) -> Option<Arc<dyn CompatibilityDirector>> {
        self.directors.get(key).cloned()
    }
}

/// The placement policy for one interface: a compatibility predicate
/// plus a selection policy.
#[derive(Debug, Clone)]
pub struct PlacementPolicy {
    /// The compatibility predicate.
    pub director: Arc<dyn CompatibilityDirector>,
    /// The selection policy narrowing the compatible set.
    pub selector: VersionSelectorPolicy,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            director: Arc::new(BackwardCompatible),
            selector: VersionSelectorPolicy::AllCompatible,
        }
    }
}

/// Placement found zero eligible versions. Non-retryable for the current
/// attempt; the caller decides whether to fail the activation request or
/// wait for a compatible deployment.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("no compatible version of {type_tag} for requested {requested}")]
pub struct NoCompatibleVersion {
    /// The interface that was requested.
    pub type_tag: TypeTag,
    /// The version that was requested.
    pub requested: InterfaceVersion,
}

/// Tracks deployed versions per interface and resolves the eligible set
/// for activation requests, per-interface policy first, cluster default
/// otherwise.
#[derive(Debug)]
pub struct PlacementResolver {
    default_policy: PlacementPolicy,
    policies: RwLock<HashMap<TypeTag, PlacementPolicy>>,
    deployed: RwLock<HashMap<TypeTag, BTreeSet<InterfaceVersion>>>,
}

impl Default for PlacementResolver {
    fn default() -> Self {
        Self::new(PlacementPolicy::default())
    }
}

impl PlacementResolver {
    /// Create a resolver with the given cluster-wide default policy.
    pub fn new(default_policy: PlacementPolicy) -> Self {
        Self {
            default_policy,
            policies: RwLock::new(HashMap::new()),
            deployed: RwLock::new(HashMap::new()),
        }
    }

    /// Bind a policy to one interface, overriding the cluster default.
    pub fn set_policy(&self, tag: TypeTag, policy: PlacementPolicy) {
        self.policies.write().unwrap().insert(tag, policy);
    }

    /// Record that `version` of `tag` is deployed somewhere in the
    /// cluster.
    pub fn record_deployment(&self, tag: TypeTag, version: InterfaceVersion) {
        self.deployed
            .write()
            .unwrap()
            .entry(tag)
            .or_default()
            .insert(version);
    }

    /// Record that `version` of `tag` is no longer deployed anywhere.
    pub fn retire_version(&self, tag: &TypeTag, version: InterfaceVersion) {
        let mut deployed = self.deployed.write().unwrap();
        if let Some(versions) = deployed.get_mut(tag) {
            versions.remove(&version);
            if versions.is_empty() {
                deployed.remove(tag);
            }
        }
    }

    /// The versions of `tag` currently deployed.
    pub fn available_versions(&self, tag: &TypeTag) -> BTreeSet<InterfaceVersion> {
        self.deployed
            .read()
            .unwrap()
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    fn policy_for(&self, tag: &TypeTag) -> PlacementPolicy {
        self.policies
            .read()
            .unwrap()
            .get(tag)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    /// The versions eligible to serve a `requested`-versioned activation
    /// of `tag`. Possibly empty; see [`NoCompatibleVersion`].
    pub fn get_suitable_versions(
        &self,
        tag: &TypeTag,
        requested: InterfaceVersion,
    ) -> Vec<InterfaceVersion> {
        let policy = self.policy_for(tag);
        suitable_versions(
            requested,
            &self.available_versions(tag),
            policy.director.as_ref(),
            policy.selector,
        )
    }

    /// Pick the single version a new activation should be created at:
    /// the newest of the eligible set.
    pub fn select_version(
        &self,
        tag: &TypeTag,
        requested: InterfaceVersion,
    ) -> Result<InterfaceVersion, NoCompatibleVersion> {
        self.get_suitable_versions(tag, requested)
            .last()
            .copied()
            .ok_or_else(|| NoCompatibleVersion {
                type_tag: tag.clone(),
                requested,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(ns: &[u16]) -> BTreeSet<InterfaceVersion> {
        ns.iter().map(|n| InterfaceVersion(*n)).collect()
    }

    #[test]
    fn test_selector_policies() {
        let available = versions(&[1, 2, 3]);
        let requested = InterfaceVersion(2);
        let director = BackwardCompatible;

        let cases = vec![
            (VersionSelectorPolicy::AllCompatible, vec![2, 3]),
            (VersionSelectorPolicy::Latest, vec![3]),
            (VersionSelectorPolicy::Minimum, vec![2]),
        ];
        for (policy, expected) in cases {
            assert_eq!(
                suitable_versions(requested, &available, &director, policy),
                expected.into_iter().map(InterfaceVersion).collect::<Vec<_>>(),
                "for {:?}",
                policy
            );
        }
    }

    #[test]
    fn test_empty_result_is_not_an_error() {
        let available = versions(&[1]);
        let got = suitable_versions(
            InterfaceVersion(2),
            &available,
            &BackwardCompatible,
            VersionSelectorPolicy::AllCompatible,
        );
        assert!(got.is_empty());
    }

    #[test]
    fn test_exact_version_director() {
        let available = versions(&[1, 2, 3]);
        assert_eq!(
            suitable_versions(
                InterfaceVersion(2),
                &available,
                &ExactVersion,
                VersionSelectorPolicy::AllCompatible,
            ),
            vec![InterfaceVersion(2)]
        );
    }

    #[test]
    fn test_registry_resolves_registered_keys() {
        let registry = CompatibilityRegistry::with_defaults();
        assert!(registry.resolve("backward-compatible").is_some());
        assert!(registry.resolve("exact").is_some());
        assert!(registry.resolve("nonsense").is_none());
    }

    #[test]
    fn test_resolver_uses_per_interface_policy() {
        let resolver = PlacementResolver::default();
        let tag = TypeTag("cart".to_string());
        for v in [1, 2, 3] {
            resolver.record_deployment(tag.clone(), InterfaceVersion(v));
        }

        // Default policy: all compatible.
        assert_eq!(
            resolver.get_suitable_versions(&tag, InterfaceVersion(2)),
            vec![InterfaceVersion(2), InterfaceVersion(3)]
        );

        // Per-interface override: latest only.
        resolver.set_policy(
            tag.clone(),
            PlacementPolicy {
                director: Arc::new(BackwardCompatible),
                selector: VersionSelectorPolicy::Latest,
            },
        );
        assert_eq!(
            resolver.get_suitable_versions(&tag, InterfaceVersion(2)),
            vec![InterfaceVersion(3)]
        );
    }

    #[test]
    fn test_select_version_reports_no_compatible_version() {
        let resolver = PlacementResolver::default();
        let tag = TypeTag("cart".to_string());
        resolver.record_deployment(tag.clone(), InterfaceVersion(1));

        assert_eq!(
            resolver.select_version(&tag, InterfaceVersion(2)),
            Err(NoCompatibleVersion {
                type_tag: tag.clone(),
                requested: InterfaceVersion(2),
            })
        );
        resolver.record_deployment(tag.clone(), InterfaceVersion(2));
        assert_eq!(
            resolver.select_version(&tag, InterfaceVersion(2)),
            Ok(InterfaceVersion(2))
        );
    }

    #[test]
    fn test_retire_version() {
        let resolver = PlacementResolver::default();
        let tag = TypeTag("cart".to_string());
        resolver.record_deployment(tag.clone(), InterfaceVersion(1));
        resolver.record_deployment(tag.clone(), InterfaceVersion(2));
        resolver.retire_version(&tag, InterfaceVersion(2));
        assert_eq!(resolver.available_versions(&tag), versions(&[1]));
        resolver.retire_version(&tag, InterfaceVersion(1));
        assert!(resolver.available_versions(&tag).is_empty());
    }
}

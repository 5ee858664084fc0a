/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! References for actors and activations.
//!
//! Identities are transparent newtypes with a concrete syntax, parseable
//! via [`FromStr`]. An actor identity is of the form `tag/key`, where the
//! tag names the actor's interface family and the key is an opaque stable
//! key within it. Identities are immutable and serve as the directory's
//! primary key.
//!
//! Activations, by contrast, are identified by an opaque unique token:
//! two activations of the same identity (e.g. before and after a
//! migration) carry distinct [`ActivationId`]s, which is what makes the
//! directory's compare-and-create and compare-and-delete contracts
//! meaningful.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// The name of an actor's interface/type family, e.g. `shopping_cart`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeTag(pub String);

impl TypeTag {
    /// The tag's name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The opaque stable key of an actor within its type family.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActorKey(pub String);

impl ActorKey {
    /// The key's string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The stable logical identity of an actor: a (type tag, key) pair.
/// There is at most one live activation per identity cluster-wide.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActorIdentity(pub TypeTag, pub ActorKey);

impl ActorIdentity {
    /// Create an identity from a tag and key.
    pub fn new(tag: impl Into<String>, key: impl Into<String>) -> Self {
        Self(TypeTag(tag.into()), ActorKey(key.into()))
    }

    /// The identity's type tag.
    pub fn type_tag(&self) -> &TypeTag {
        &self.0
    }

    /// The identity's key.
    pub fn key(&self) -> &ActorKey {
        &self.1
    }
}

impl fmt::Display for ActorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.0, self.1)
    }
}

/// Errors that occur while parsing references.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ReferenceParsingError {
    /// The identity was missing its `tag/key` separator.
    #[error("invalid actor identity {0:?}: expected tag/key")]
    MissingSeparator(String),

    /// A component of the reference was empty.
    #[error("invalid actor identity {0:?}: empty component")]
    EmptyComponent(String),
}

impl FromStr for ActorIdentity {
    type Err = ReferenceParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, key) = s
            .split_once('/')
            .ok_or_else(|| ReferenceParsingError::MissingSeparator(s.to_string()))?;
        if tag.is_empty() || key.is_empty() {
            return Err(ReferenceParsingError::EmptyComponent(s.to_string()));
        }
        Ok(Self::new(tag, key))
    }
}

/// An opaque unique token identifying one activation of an actor.
/// Replaced on every (re-)activation; never reused.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActivationId(Uuid);

impl ActivationId {
    /// Mint a fresh activation token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first group is enough to tell activations apart in logs.
        let s = self.0.simple().to_string();
        write!(f, "{}", &s[..8])
    }
}

/// The version of an actor interface deployed to the cluster. Totally
/// ordered; displayed as `v{n}`.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct InterfaceVersion(pub u16);

impl fmt::Display for InterfaceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_parse() {
        let cases: Vec<(&str, ActorIdentity)> = vec![
            ("cart/user-42", ActorIdentity::new("cart", "user-42")),
            (
                "inventory/sku/with/slashes",
                ActorIdentity::new("inventory", "sku/with/slashes"),
            ),
        ];
        for (s, expected) in cases {
            assert_eq!(s.parse::<ActorIdentity>().unwrap(), expected, "for {}", s);
            assert_eq!(expected.to_string().parse::<ActorIdentity>().unwrap(), expected);
        }
    }

    #[test]
    fn test_identity_parse_error() {
        assert_eq!(
            "no-separator".parse::<ActorIdentity>(),
            Err(ReferenceParsingError::MissingSeparator(
                "no-separator".to_string()
            ))
        );
        assert_eq!(
            "/key".parse::<ActorIdentity>(),
            Err(ReferenceParsingError::EmptyComponent("/key".to_string()))
        );
        assert_eq!(
            "tag/".parse::<ActorIdentity>(),
            Err(ReferenceParsingError::EmptyComponent("tag/".to_string()))
        );
    }

    #[test]
    fn test_activation_ids_unique() {
        assert_ne!(ActivationId::generate(), ActivationId::generate());
    }

    #[test]
    fn test_interface_version_ordering() {
        assert!(InterfaceVersion(1) < InterfaceVersion(2));
        assert_eq!(InterfaceVersion(3).to_string(), "v3");
    }
}

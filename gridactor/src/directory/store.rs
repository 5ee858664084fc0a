/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Durable backing for directory partitions.
//!
//! The store is an optional external collaborator: a key-value store
//! keyed by identity hash, range-scannable so that a host that takes
//! ownership of a partition after a membership change can rehydrate the
//! entries in its newly owned hash ranges. Without a store, the new
//! owner starts empty and callers observe a bounded window of NotFound
//! followed by re-registration.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::directory::ActivationRecord;
use crate::partition::HashRange;
use crate::reference::ActorIdentity;

/// A range-scannable key-value store for activation records, keyed by
/// the identity's ring hash.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Write (or overwrite) the record for its identity.
    async fn put(&self, hash: u64, record: &ActivationRecord) -> Result<(), anyhow::Error>;

    /// Read the record for an identity, if present.
    async fn get(
        &self,
        hash: u64,
        identity: &ActorIdentity,
    ) -> Result<Option<ActivationRecord>, anyhow::Error>;

    /// Remove the record for an identity. Removing an absent record is
    /// not an error.
    async fn delete(&self, hash: u64, identity: &ActorIdentity) -> Result<(), anyhow::Error>;

    /// All records whose identity hash falls within `range`.
    async fn scan_range(&self, range: HashRange) -> Result<Vec<ActivationRecord>, anyhow::Error>;
}

/// An in-process [`DirectoryStore`] for tests and single-host
/// deployments.
#[derive(Debug, Default)]
pub struct InMemoryDirectoryStore {
    records: RwLock<BTreeMap<(u64, ActorIdentity), ActivationRecord>>,
}

impl InMemoryDirectoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of records currently stored.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store holds no records.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl DirectoryStore for InMemoryDirectoryStore {
    async fn put(&self, hash: u64, record: &ActivationRecord) -> Result<(), anyhow::Error> {
        self.records
            .write()
            .await
            .insert((hash, record.identity.clone()), record.clone());
        Ok(())
    }

    async fn get(
        &self,
        hash: u64,
        identity: &ActorIdentity,
    ) -> Result<Option<ActivationRecord>, anyhow::Error> {
        Ok(self
            .records
            .read()
            .await
            .get(&(hash, identity.clone()))
            .cloned())
    }

    async fn delete(&self, hash: u64, identity: &ActorIdentity) -> Result<(), anyhow::Error> {
        self.records.write().await.remove(&(hash, identity.clone()));
        Ok(())
    }

    async fn scan_range(&self, range: HashRange) -> Result<Vec<ActivationRecord>, anyhow::Error> {
        // A linear scan is fine for the in-process reference store; a
        // real backend would use the hash prefix of the key.
        let records = self.records.read().await;
        let mut out = Vec::new();
        for ((hash, _), record) in records.iter() {
            if range.contains(*hash) {
                out.push(record.clone());
            }
        }
        Ok(out)
    }
}

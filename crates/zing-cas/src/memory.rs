// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Process-local blob tier.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::{blob_hash, BlobHash, BlobStore, CasError};

/// Blobs held in memory, ordered by hash.
///
/// Blobs written outside a commit (a transaction staging a template, say)
/// stay unpinned until a changeset references them; [`sweep_unpinned`]
/// reclaims the ones that never were.
///
/// [`sweep_unpinned`]: MemoryTier::sweep_unpinned
#[derive(Debug, Default, Clone)]
pub struct MemoryTier {
    blobs: BTreeMap<BlobHash, Arc<[u8]>>,
    pinned: BTreeSet<BlobHash>,
}

impl MemoryTier {
    /// Empty tier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Drops every unpinned blob and returns how many went.
    pub fn sweep_unpinned(&mut self) -> usize {
        let before = self.blobs.len();
        let pinned = &self.pinned;
        self.blobs.retain(|hash, _| pinned.contains(hash));
        before - self.blobs.len()
    }
}

impl BlobStore for MemoryTier {
    fn put(&mut self, bytes: &[u8]) -> BlobHash {
        let hash = blob_hash(bytes);
        self.blobs.entry(hash).or_insert_with(|| Arc::from(bytes));
        hash
    }

    fn put_verified(&mut self, declared: BlobHash, bytes: &[u8]) -> Result<(), CasError> {
        let actual = blob_hash(bytes);
        if actual != declared {
            return Err(CasError::HashMismatch { declared, actual });
        }
        self.blobs.entry(actual).or_insert_with(|| Arc::from(bytes));
        Ok(())
    }

    fn get(&self, hash: &BlobHash) -> Option<Arc<[u8]>> {
        self.blobs.get(hash).cloned()
    }

    fn has(&self, hash: &BlobHash) -> bool {
        self.blobs.contains_key(hash)
    }

    fn pin(&mut self, hash: &BlobHash) {
        self.pinned.insert(*hash);
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory repository implementing both [`ContentStore`] and
//! [`RecordIndex`].
//!
//! Blobs live in a [`MemoryTier`]; every blob referenced by a committed delta
//! (and every committed template) is pinned. The live record/link set of a
//! changeset is materialized on demand by replaying deltas from the nearest
//! cached ancestor along baseline pointers, then cached as an immutable
//! snapshot.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;
use zing_cas::{blob_hash, BlobHash, BlobStore, MemoryTier};

use crate::codec::{self, ChangesetDelta, Entry, DELTA_VERSION};
use crate::ident::{make_changeset_id, ChangesetId, DagNum, RecId};
use crate::index::{HistoryEntry, LinkFilter, Predicate, RecordIndex};
use crate::record::{LinkKey, Record};
use crate::store::{Audit, Changeset, CommitBatch, ContentStore, StoreError};

/// Live records and links at one changeset.
#[derive(Clone, Debug, Default)]
struct LiveState {
    records: BTreeMap<RecId, BlobHash>,
    links: BTreeMap<LinkKey, BlobHash>,
    template: Option<BlobHash>,
}

/// Reference repository held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryRepo {
    blobs: MemoryTier,
    changesets: BTreeMap<ChangesetId, Arc<Changeset>>,
    leaves: BTreeMap<DagNum, BTreeSet<ChangesetId>>,
    history: BTreeMap<RecId, Vec<HistoryEntry>>,
    states: RwLock<BTreeMap<ChangesetId, Arc<LiveState>>>,
}

impl MemoryRepo {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored changesets across all DAGs.
    pub fn changeset_count(&self) -> usize {
        self.changesets.len()
    }

    /// Underlying blob tier.
    pub fn blobs(&self) -> &MemoryTier {
        &self.blobs
    }

    /// Drops blobs no committed changeset references.
    pub fn sweep(&mut self) -> usize {
        self.blobs.sweep_unpinned()
    }

    fn changeset(&self, id: &ChangesetId) -> Result<Arc<Changeset>, StoreError> {
        self.changesets
            .get(id)
            .cloned()
            .ok_or(StoreError::ChangesetNotFound(*id))
    }

    fn cached_state(&self, id: &ChangesetId) -> Option<Arc<LiveState>> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn publish_state(&self, id: ChangesetId, state: Arc<LiveState>) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, state);
    }

    fn live_state(&self, state: Option<&ChangesetId>) -> Result<Arc<LiveState>, StoreError> {
        let Some(id) = state else {
            return Ok(Arc::new(LiveState::default()));
        };
        if let Some(hit) = self.cached_state(id) {
            return Ok(hit);
        }
        let mut chain = Vec::new();
        let mut base = Arc::new(LiveState::default());
        let mut cursor = Some(*id);
        while let Some(current) = cursor {
            if let Some(hit) = self.cached_state(&current) {
                base = hit;
                break;
            }
            let cs = self.changeset(&current)?;
            cursor = cs.delta.baseline;
            chain.push(cs);
        }
        let mut live = (*base).clone();
        for cs in chain.iter().rev() {
            self.apply_delta(&mut live, &cs.delta, &BTreeMap::new())?;
        }
        debug!(changeset = %id.short(), replayed = chain.len(), "materialized live state");
        let live = Arc::new(live);
        self.publish_state(*id, Arc::clone(&live));
        Ok(live)
    }

    fn entry(
        &self,
        hash: &BlobHash,
        staged: &BTreeMap<BlobHash, &[u8]>,
    ) -> Result<Entry, StoreError> {
        if let Some(bytes) = staged.get(hash) {
            return Ok(codec::decode_entry(bytes)?);
        }
        let bytes = self.blobs.get(hash).ok_or(StoreError::BlobMissing(*hash))?;
        Ok(codec::decode_entry(&bytes)?)
    }

    fn apply_delta(
        &self,
        live: &mut LiveState,
        delta: &ChangesetDelta,
        staged: &BTreeMap<BlobHash, &[u8]>,
    ) -> Result<(), StoreError> {
        for hash in &delta.remove {
            let removed = match self.entry(hash, staged)? {
                Entry::Record(rec) => live.records.remove(rec.recid()),
                Entry::Link(link) => live.links.remove(&link),
            };
            if removed != Some(*hash) {
                return Err(StoreError::DeltaMismatch(format!(
                    "removed blob {hash} is not live at the baseline"
                )));
            }
        }
        for hash in &delta.add {
            let replaced = match self.entry(hash, staged)? {
                Entry::Record(rec) => live.records.insert(rec.recid().clone(), *hash),
                Entry::Link(link) => live.links.insert(link, *hash),
            };
            if replaced.is_some() {
                return Err(StoreError::DeltaMismatch(format!(
                    "added blob {hash} replaces a live entry that was not removed"
                )));
            }
        }
        if let Some(template) = delta.template {
            live.template = Some(template);
        }
        Ok(())
    }

    fn record_at(&self, hash: &BlobHash) -> Result<Record, StoreError> {
        match self.entry(hash, &BTreeMap::new())? {
            Entry::Record(rec) => Ok(rec),
            Entry::Link(_) => Err(StoreError::Corrupt(format!(
                "blob {hash} is a link, expected a record"
            ))),
        }
    }
}

impl ContentStore for MemoryRepo {
    fn fetch_blob(&self, hash: &BlobHash) -> Result<Arc<[u8]>, StoreError> {
        self.blobs.get(hash).ok_or(StoreError::BlobMissing(*hash))
    }

    fn store_blob(&mut self, bytes: &[u8]) -> BlobHash {
        self.blobs.put(bytes)
    }

    fn fetch_changeset(&self, id: &ChangesetId) -> Result<Arc<Changeset>, StoreError> {
        self.changeset(id)
    }

    fn create_changeset(&mut self, batch: CommitBatch) -> Result<ChangesetId, StoreError> {
        let CommitBatch {
            dagnum,
            parents,
            delta,
            blobs,
            audit,
        } = batch;

        // Validate.
        if delta.version != DELTA_VERSION {
            return Err(StoreError::BadBatch(format!(
                "unsupported delta version {}",
                delta.version
            )));
        }
        if delta.baseline != parents.first().copied() {
            return Err(StoreError::BadBatch(
                "delta baseline must be the first parent".to_owned(),
            ));
        }
        let distinct: BTreeSet<&ChangesetId> = parents.iter().collect();
        if distinct.len() != parents.len() {
            return Err(StoreError::BadBatch("duplicate parent".to_owned()));
        }
        let mut generation = 0;
        for parent in &parents {
            let cs = self.changeset(parent)?;
            if cs.dagnum != dagnum {
                return Err(StoreError::DagMismatch {
                    parent: *parent,
                    expected: dagnum,
                    found: cs.dagnum,
                });
            }
            generation = generation.max(cs.generation);
        }
        let hashes: Vec<BlobHash> = blobs.iter().map(|b| blob_hash(b)).collect();
        let staged: BTreeMap<BlobHash, &[u8]> = hashes
            .iter()
            .copied()
            .zip(blobs.iter().map(Vec::as_slice))
            .collect();
        if let Some(template) = &delta.template {
            if !staged.contains_key(template) && !self.blobs.has(template) {
                return Err(StoreError::BlobMissing(*template));
            }
        }
        let mut live = (*self.live_state(delta.baseline.as_ref())?).clone();
        self.apply_delta(&mut live, &delta, &staged)?;

        let id = make_changeset_id(dagnum, &parents, &codec::encode_delta(&delta)?, &audit);
        if self.changesets.contains_key(&id) {
            return Ok(id);
        }

        // Write.
        for (hash, bytes) in &staged {
            self.blobs.put_verified(*hash, bytes)?;
        }
        for hash in delta.add.iter().chain(&delta.template) {
            self.blobs.pin(hash);
        }
        let changeset = Changeset {
            id,
            dagnum,
            parents,
            generation: generation + 1,
            delta,
            audit,
        };
        for hash in &changeset.delta.add {
            if let Some(Entry::Record(rec)) = staged
                .get(hash)
                .and_then(|bytes| codec::decode_entry(bytes).ok())
                .or_else(|| self.blobs.get(hash).and_then(|b| codec::decode_entry(&b).ok()))
            {
                let versions = self.history.entry(rec.recid().clone()).or_default();
                versions.push(HistoryEntry {
                    hash: *hash,
                    changeset: id,
                    generation: changeset.generation,
                    audit: changeset.audit.clone(),
                });
                versions.sort_by(|a, b| {
                    b.generation
                        .cmp(&a.generation)
                        .then(b.audit.when.cmp(&a.audit.when))
                });
            }
        }
        let leaves = self.leaves.entry(dagnum).or_default();
        for parent in &changeset.parents {
            leaves.remove(parent);
        }
        leaves.insert(id);
        debug!(
            changeset = %id.short(),
            dagnum,
            generation = changeset.generation,
            "changeset stored"
        );
        self.changesets.insert(id, Arc::new(changeset));
        self.publish_state(id, Arc::new(live));
        Ok(id)
    }

    fn fetch_dag_leaves(&self, dagnum: DagNum) -> BTreeSet<ChangesetId> {
        self.leaves.get(&dagnum).cloned().unwrap_or_default()
    }
}

impl RecordIndex for MemoryRepo {
    fn resolve_current_hash(
        &self,
        recid: &RecId,
        state: Option<&ChangesetId>,
    ) -> Result<Option<BlobHash>, StoreError> {
        Ok(self.live_state(state)?.records.get(recid).copied())
    }

    fn query(
        &self,
        predicate: &Predicate,
        state: Option<&ChangesetId>,
    ) -> Result<Vec<RecId>, StoreError> {
        let live = self.live_state(state)?;
        let mut out = Vec::new();
        for (recid, hash) in &live.records {
            if matches!(predicate, Predicate::All) || predicate.matches(&self.record_at(hash)?) {
                out.push(recid.clone());
            }
        }
        Ok(out)
    }

    fn query_links(
        &self,
        filter: &LinkFilter,
        state: Option<&ChangesetId>,
    ) -> Result<Vec<LinkKey>, StoreError> {
        Ok(self
            .live_state(state)?
            .links
            .keys()
            .filter(|link| filter.matches(link))
            .cloned()
            .collect())
    }

    fn resolve_link_hash(
        &self,
        link: &LinkKey,
        state: Option<&ChangesetId>,
    ) -> Result<Option<BlobHash>, StoreError> {
        Ok(self.live_state(state)?.links.get(link).copied())
    }

    fn template_hash(&self, state: Option<&ChangesetId>) -> Result<Option<BlobHash>, StoreError> {
        Ok(self.live_state(state)?.template)
    }

    fn lookup_audits(&self, changeset: &ChangesetId) -> Result<Vec<Audit>, StoreError> {
        Ok(vec![self.changeset(changeset)?.audit.clone()])
    }

    fn record_history(&self, recid: &RecId) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self.history.get(recid).cloned().unwrap_or_default())
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content store interface: blobs and changeset nodes.
use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use zing_cas::{BlobHash, CasError};

use crate::codec::{ChangesetDelta, CodecError};
use crate::ident::{ChangesetId, DagNum};
use crate::index::RecordIndex;

/// Who made a changeset and when (Unix seconds).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Audit {
    /// User name.
    pub who: String,
    /// Commit time.
    pub when: i64,
}

impl Audit {
    /// Builds an audit entry.
    pub fn new(who: impl Into<String>, when: i64) -> Self {
        Self {
            who: who.into(),
            when,
        }
    }
}

/// A persisted changeset node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Changeset {
    /// Node id.
    pub id: ChangesetId,
    /// Owning DAG.
    pub dagnum: DagNum,
    /// Parents; the baseline comes first.
    pub parents: Vec<ChangesetId>,
    /// Distance from the root along the longest parent path; roots are 1.
    pub generation: u64,
    /// Changes relative to the baseline.
    pub delta: ChangesetDelta,
    /// Author and time.
    pub audit: Audit,
}

/// Everything one commit writes.
///
/// `blobs` holds the bytes of every added entry and of a replaced template.
/// The store validates the whole batch before writing any of it.
#[derive(Clone, Debug)]
pub struct CommitBatch {
    /// Target DAG.
    pub dagnum: DagNum,
    /// Declared parents; `parents[0]` must equal `delta.baseline`.
    pub parents: Vec<ChangesetId>,
    /// Delta to record.
    pub delta: ChangesetDelta,
    /// New blob bytes.
    pub blobs: Vec<Vec<u8>>,
    /// Author and time.
    pub audit: Audit,
}

/// Content store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// A referenced blob is not stored.
    #[error("[STORE_BLOB_MISSING] blob {0} not found")]
    BlobMissing(BlobHash),
    /// A referenced changeset is not stored.
    #[error("[STORE_CHANGESET_MISSING] changeset {0} not found")]
    ChangesetNotFound(ChangesetId),
    /// A parent belongs to another DAG.
    #[error("[STORE_DAG_MISMATCH] changeset {parent} is in dag {found}, not {expected}")]
    DagMismatch {
        /// Offending parent.
        parent: ChangesetId,
        /// DAG requested by the batch.
        expected: DagNum,
        /// DAG the parent lives in.
        found: DagNum,
    },
    /// The batch is internally inconsistent.
    #[error("[STORE_BAD_BATCH] {0}")]
    BadBatch(String),
    /// A delta does not apply to its baseline state.
    #[error("[STORE_DELTA_MISMATCH] {0}")]
    DeltaMismatch(String),
    /// A stored blob is not the kind of entry its reference expects.
    #[error("[STORE_CORRUPT] {0}")]
    Corrupt(String),
    /// Blob encoding failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// CAS failure.
    #[error(transparent)]
    Cas(#[from] CasError),
}

/// Blob and changeset storage.
pub trait ContentStore {
    /// Returns the bytes of a stored blob.
    ///
    /// # Errors
    ///
    /// [`StoreError::BlobMissing`] if absent.
    fn fetch_blob(&self, hash: &BlobHash) -> Result<Arc<[u8]>, StoreError>;

    /// Stores a blob outside any changeset. Unpinned until a commit
    /// references it.
    fn store_blob(&mut self, bytes: &[u8]) -> BlobHash;

    /// Returns a changeset node.
    ///
    /// # Errors
    ///
    /// [`StoreError::ChangesetNotFound`] if absent.
    fn fetch_changeset(&self, id: &ChangesetId) -> Result<Arc<Changeset>, StoreError>;

    /// Validates and writes a commit as one unit. Nothing is written when
    /// validation fails.
    ///
    /// # Errors
    ///
    /// Any [`StoreError`] describing why the batch was rejected.
    fn create_changeset(&mut self, batch: CommitBatch) -> Result<ChangesetId, StoreError>;

    /// Current leaves (changesets without children) of a DAG.
    fn fetch_dag_leaves(&self, dagnum: DagNum) -> BTreeSet<ChangesetId>;
}

/// A store that is also queryable: what transactions and merges run against.
pub trait Repository: ContentStore + RecordIndex {}

impl<T: ContentStore + RecordIndex> Repository for T {}

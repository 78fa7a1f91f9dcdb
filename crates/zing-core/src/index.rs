// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Secondary index interface: which records and links are live at a state.
//!
//! A *state* is a changeset id; `None` is the empty state before a DAG's
//! first commit.
use std::collections::BTreeSet;

use zing_cas::BlobHash;

use crate::ident::{ChangesetId, RecId};
use crate::record::{LinkKey, Record};
use crate::store::{Audit, StoreError};

/// Structured record filter.
///
/// This is the tree a WHERE clause would be parsed into; no text syntax is
/// provided.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// Every record.
    All,
    /// Records of one rectype.
    Rectype(String),
    /// Field equal to an encoded value.
    FieldEq {
        /// Field name.
        field: String,
        /// Encoded value.
        value: String,
    },
    /// Field equal to any of the encoded values.
    FieldIn {
        /// Field name.
        field: String,
        /// Encoded values.
        values: BTreeSet<String>,
    },
    /// Field is set.
    HasField(String),
    /// All sub-predicates hold.
    And(Vec<Predicate>),
    /// Any sub-predicate holds.
    Or(Vec<Predicate>),
    /// Sub-predicate does not hold.
    Not(Box<Predicate>),
}

impl Predicate {
    /// `Rectype(name)`.
    pub fn rectype(name: impl Into<String>) -> Self {
        Self::Rectype(name.into())
    }

    /// `FieldEq { field, value }`.
    pub fn field_eq(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::FieldEq {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Conjunction of `self` and `other`.
    pub fn and(self, other: Self) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Evaluates the predicate against one record.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::All => true,
            Self::Rectype(name) => record.rectype() == name,
            Self::FieldEq { field, value } => record.get(field) == Some(value.as_str()),
            Self::FieldIn { field, values } => record.get(field).is_some_and(|v| values.contains(v)),
            Self::HasField(field) => record.get(field).is_some(),
            Self::And(parts) => parts.iter().all(|p| p.matches(record)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(record)),
            Self::Not(inner) => !inner.matches(record),
        }
    }
}

/// Link filter; unset members match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkFilter {
    /// Source record.
    pub from: Option<RecId>,
    /// Target record.
    pub to: Option<RecId>,
    /// Link name.
    pub name: Option<String>,
}

impl LinkFilter {
    /// Links leaving `from`.
    pub fn outgoing(from: &RecId) -> Self {
        Self {
            from: Some(from.clone()),
            ..Self::default()
        }
    }

    /// Links arriving at `to`.
    pub fn incoming(to: &RecId) -> Self {
        Self {
            to: Some(to.clone()),
            ..Self::default()
        }
    }

    /// Narrows to one link name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether `link` passes the filter.
    pub fn matches(&self, link: &LinkKey) -> bool {
        self.from.as_ref().map_or(true, |f| *f == link.from)
            && self.to.as_ref().map_or(true, |t| *t == link.to)
            && self.name.as_ref().map_or(true, |n| *n == link.name)
    }
}

/// One version of a record in its history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Blob hash of this version.
    pub hash: BlobHash,
    /// Changeset that made it live.
    pub changeset: ChangesetId,
    /// Generation of that changeset.
    pub generation: u64,
    /// Author and time of that changeset.
    pub audit: Audit,
}

/// Queries over live records and links.
pub trait RecordIndex {
    /// Blob hash of the live version of `recid`, `None` if not live.
    ///
    /// # Errors
    ///
    /// Store failures while materializing `state`.
    fn resolve_current_hash(
        &self,
        recid: &RecId,
        state: Option<&ChangesetId>,
    ) -> Result<Option<BlobHash>, StoreError>;

    /// Recids of live records matching `predicate`, in recid order.
    ///
    /// # Errors
    ///
    /// Store failures while materializing `state`.
    fn query(
        &self,
        predicate: &Predicate,
        state: Option<&ChangesetId>,
    ) -> Result<Vec<RecId>, StoreError>;

    /// Live links matching `filter`, in key order.
    ///
    /// # Errors
    ///
    /// Store failures while materializing `state`.
    fn query_links(
        &self,
        filter: &LinkFilter,
        state: Option<&ChangesetId>,
    ) -> Result<Vec<LinkKey>, StoreError>;

    /// Blob hash of a live link, `None` if not live.
    ///
    /// # Errors
    ///
    /// Store failures while materializing `state`.
    fn resolve_link_hash(
        &self,
        link: &LinkKey,
        state: Option<&ChangesetId>,
    ) -> Result<Option<BlobHash>, StoreError>;

    /// Template blob in effect at `state`.
    ///
    /// # Errors
    ///
    /// Store failures while materializing `state`.
    fn template_hash(&self, state: Option<&ChangesetId>) -> Result<Option<BlobHash>, StoreError>;

    /// Audit entries of a changeset.
    ///
    /// # Errors
    ///
    /// [`StoreError::ChangesetNotFound`] if absent.
    fn lookup_audits(&self, changeset: &ChangesetId) -> Result<Vec<Audit>, StoreError>;

    /// Every version of `recid` ever committed, in any DAG branch,
    /// newest first.
    ///
    /// # Errors
    ///
    /// Store failures.
    fn record_history(&self, recid: &RecId) -> Result<Vec<HistoryEntry>, StoreError>;
}

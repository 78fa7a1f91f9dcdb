// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Records and link identities.
use std::collections::{BTreeMap, BTreeSet};

use zing_cas::{blob_hash, BlobHash};

use crate::codec;
use crate::ident::RecId;

/// Stored member holding the record id.
pub const FIELD_RECID: &str = "recid";
/// Stored member holding the rectype name.
pub const FIELD_RECTYPE: &str = "rectype";

/// Names no field or link side may use.
pub const RESERVED_NAMES: [&str; 4] = ["recid", "rechid", "rectype", "history"];

/// Returns `true` if `name` is reserved by the engine.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// One record as seen by a transaction.
///
/// `fields` holds user fields only, in canonical string form; `recid` and
/// `rectype` are kept alongside and written as ordinary members when the
/// record is encoded. Bookkeeping (`dirty_fields`, `dirty_links`, `deleted`,
/// `original`) belongs to the owning transaction and is never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    recid: RecId,
    rectype: String,
    fields: BTreeMap<String, String>,
    pub(crate) dirty_fields: BTreeSet<String>,
    pub(crate) dirty_links: bool,
    pub(crate) deleted: bool,
    pub(crate) original: Option<BlobHash>,
}

impl Record {
    /// Fresh record that has never been persisted.
    pub(crate) fn new(recid: RecId, rectype: impl Into<String>) -> Self {
        Self {
            recid,
            rectype: rectype.into(),
            fields: BTreeMap::new(),
            dirty_fields: BTreeSet::new(),
            dirty_links: false,
            deleted: false,
            original: None,
        }
    }

    /// Record assembled from stored parts, as decoded from a blob or
    /// supplied by an importer.
    pub fn from_parts(
        recid: RecId,
        rectype: String,
        fields: BTreeMap<String, String>,
    ) -> Self {
        Self {
            fields,
            ..Self::new(recid, rectype)
        }
    }

    /// Record id.
    pub fn recid(&self) -> &RecId {
        &self.recid
    }

    /// Rectype name.
    pub fn rectype(&self) -> &str {
        &self.rectype
    }

    /// Stored value of `field`, if set.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// All user fields in name order.
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Hash of the blob this record was loaded from; `None` for new records.
    pub fn original_hash(&self) -> Option<BlobHash> {
        self.original
    }

    /// `true` until the record has been persisted once.
    pub fn is_new(&self) -> bool {
        self.original.is_none()
    }

    /// `true` once the record is staged for deletion.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// `true` if the record needs re-encoding at commit.
    pub fn is_dirty(&self) -> bool {
        self.original.is_none() || !self.dirty_fields.is_empty()
    }

    /// `true` if any link touching this record changed in the transaction.
    pub fn links_dirty(&self) -> bool {
        self.dirty_links
    }

    /// Content hash of the record's canonical encoding.
    pub fn content_hash(&self) -> BlobHash {
        blob_hash(&codec::encode_record(self))
    }

    /// Stores `value` (or clears the field for `None`). Returns whether the
    /// stored content changed; a change marks the field dirty.
    pub(crate) fn put(&mut self, field: &str, value: Option<String>) -> bool {
        let changed = match value {
            Some(v) if self.fields.get(field) == Some(&v) => false,
            Some(v) => {
                self.fields.insert(field.to_owned(), v);
                true
            }
            None => self.fields.remove(field).is_some(),
        };
        if changed {
            self.dirty_fields.insert(field.to_owned());
        }
        changed
    }

    /// Replaces all user fields at once, marking every differing field dirty.
    pub(crate) fn replace_fields(&mut self, fields: BTreeMap<String, String>) {
        let names: BTreeSet<String> = self.fields.keys().chain(fields.keys()).cloned().collect();
        for name in names {
            if self.fields.get(&name) != fields.get(&name) {
                self.dirty_fields.insert(name);
            }
        }
        self.fields = fields;
    }
}

/// Identity of a directed link: `(from, to, name)`.
///
/// Links carry no payload; the triple is the whole link.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkKey {
    /// Source record.
    pub from: RecId,
    /// Target record.
    pub to: RecId,
    /// Link type name.
    pub name: String,
}

impl LinkKey {
    /// Builds a link key.
    pub fn new(from: RecId, to: RecId, name: impl Into<String>) -> Self {
        Self {
            from,
            to,
            name: name.into(),
        }
    }

    /// Content hash of the link's canonical encoding.
    pub fn content_hash(&self) -> BlobHash {
        blob_hash(&codec::encode_link(self))
    }
}

impl std::fmt::Display for LinkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -[{}]-> {}", self.from, self.name, self.to)
    }
}

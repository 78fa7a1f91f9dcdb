// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifier and hashing utilities.
use blake3::Hasher;

use crate::store::Audit;

/// Canonical 256-bit hash used for changeset identity.
pub type Hash = [u8; 32];

/// Number of a DAG inside one repository.
///
/// A repository may hold several independent DAGs; every changeset belongs to
/// exactly one of them.
pub type DagNum = u32;

/// Globally unique, immutable identifier of a logical record.
///
/// Recids are independent of content: editing a record changes its content
/// hash, never its recid. Fresh recids are UUID v4 values rendered as 32
/// lowercase hex digits, and are never reused.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RecId(String);

impl RecId {
    /// Generates a fresh recid.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wraps an existing recid string (for example one read back from a blob).
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Returns the recid text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one changeset node in a DAG.
///
/// Produced by [`make_changeset_id`]; the id commits to the DAG number, the
/// ordered parents, the encoded delta and the audit entry.
#[repr(transparent)]
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize, serde::Deserialize,
)]
pub struct ChangesetId(pub Hash);

impl ChangesetId {
    /// Returns the canonical byte representation of this id.
    #[must_use]
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }

    /// First four bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for ChangesetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Produces a domain-separated changeset identifier (prefix `b"changeset:"`).
///
/// Layout: dagnum (u32 LE), parent count (u64 LE), each parent's 32 bytes,
/// delta length (u64 LE) and bytes, then the audit `who` (length-prefixed) and
/// `when` (i64 LE).
pub fn make_changeset_id(
    dagnum: DagNum,
    parents: &[ChangesetId],
    delta_bytes: &[u8],
    audit: &Audit,
) -> ChangesetId {
    let mut hasher = Hasher::new();
    hasher.update(b"changeset:");
    hasher.update(&dagnum.to_le_bytes());
    hasher.update(&(parents.len() as u64).to_le_bytes());
    for parent in parents {
        hasher.update(&parent.0);
    }
    hasher.update(&(delta_bytes.len() as u64).to_le_bytes());
    hasher.update(delta_bytes);
    hasher.update(&(audit.who.len() as u64).to_le_bytes());
    hasher.update(audit.who.as_bytes());
    hasher.update(&audit.when.to_le_bytes());
    ChangesetId(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audit() -> Audit {
        Audit {
            who: "alice".into(),
            when: 100,
        }
    }

    #[test]
    fn generated_recids_are_distinct_hex() {
        let a = RecId::generate();
        let b = RecId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn changeset_id_commits_to_parent_order_and_audit() {
        let p1 = ChangesetId([1; 32]);
        let p2 = ChangesetId([2; 32]);
        let a = make_changeset_id(1, &[p1, p2], b"delta", &audit());
        let b = make_changeset_id(1, &[p2, p1], b"delta", &audit());
        assert_ne!(a, b);
        let later = Audit {
            when: 101,
            ..audit()
        };
        assert_ne!(a, make_changeset_id(1, &[p1, p2], b"delta", &later));
        assert_ne!(a, make_changeset_id(2, &[p1, p2], b"delta", &audit()));
        assert_eq!(a, make_changeset_id(1, &[p1, p2], b"delta", &audit()));
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Net changes between an ancestor state and a leaf.
//!
//! Changes are computed from the two live states, so an entry added and
//! later removed on the same branch (or the reverse) cancels out.
use std::collections::{BTreeMap, BTreeSet};

use zing_cas::BlobHash;

use crate::ident::{ChangesetId, RecId};
use crate::index::{LinkFilter, Predicate};
use crate::record::LinkKey;
use crate::store::{Repository, StoreError};

/// What happened to one record on one branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChangeSummary {
    /// Not live at the ancestor, live at the leaf.
    Added(BlobHash),
    /// Live at the ancestor, gone at the leaf.
    Deleted,
    /// Live at both with different content.
    Modified(BlobHash),
}

impl ChangeSummary {
    /// Blob of the record at the leaf, if live there.
    pub(crate) fn hash(self) -> Option<BlobHash> {
        match self {
            Self::Added(h) | Self::Modified(h) => Some(h),
            Self::Deleted => None,
        }
    }
}

/// Everything one leaf changed relative to the ancestor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct LeafChanges {
    pub(crate) records: BTreeMap<RecId, ChangeSummary>,
    pub(crate) links_added: BTreeSet<LinkKey>,
    pub(crate) links_removed: BTreeSet<LinkKey>,
    /// New template blob, when the leaf replaced it.
    pub(crate) template: Option<BlobHash>,
}

/// Net changes from `ancestor` to `leaf`.
pub(crate) fn collect_changes<S: Repository>(
    store: &S,
    ancestor: &ChangesetId,
    leaf: &ChangesetId,
) -> Result<LeafChanges, StoreError> {
    let base = Some(ancestor);
    let tip = Some(leaf);
    let mut recids: BTreeSet<RecId> = store.query(&Predicate::All, base)?.into_iter().collect();
    recids.extend(store.query(&Predicate::All, tip)?);
    let mut records = BTreeMap::new();
    for recid in recids {
        let before = store.resolve_current_hash(&recid, base)?;
        let after = store.resolve_current_hash(&recid, tip)?;
        let change = match (before, after) {
            (None, Some(h)) => ChangeSummary::Added(h),
            (Some(_), None) => ChangeSummary::Deleted,
            (Some(x), Some(y)) if x != y => ChangeSummary::Modified(y),
            _ => continue,
        };
        records.insert(recid, change);
    }
    let all = LinkFilter::default();
    let before: BTreeSet<LinkKey> = store.query_links(&all, base)?.into_iter().collect();
    let after: BTreeSet<LinkKey> = store.query_links(&all, tip)?.into_iter().collect();
    let template_before = store.template_hash(base)?;
    let template_after = store.template_hash(tip)?;
    Ok(LeafChanges {
        records,
        links_added: after.difference(&before).cloned().collect(),
        links_removed: before.difference(&after).cloned().collect(),
        template: template_after.filter(|t| template_before != Some(*t)),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::memory::MemoryRepo;
    use crate::template::TemplateCache;
    use crate::tx::Transaction;

    const TEMPLATE: &str = r#"{
        "rectypes": { "note": { "fields": { "text": { "datatype": "string" } } } },
        "directed_linktypes": {
            "refers": { "from": { "link_rectypes": ["note"] }, "to": { "link_rectypes": ["note"] } }
        }
    }"#;

    #[test]
    fn changes_are_net_of_intermediate_commits() {
        let mut repo = MemoryRepo::new();
        let config = EngineConfig::default();
        let mut tx = Transaction::begin(
            &mut repo,
            &mut TemplateCache::new(1),
            &config,
            1,
            "a",
            None,
        )
        .unwrap();
        tx.set_template(TEMPLATE.as_bytes()).unwrap();
        let kept = tx.create_record("note").unwrap();
        let gone = tx.create_record("note").unwrap();
        tx.set_string(&kept, "text", "v1").unwrap();
        let ancestor = tx.commit(1).unwrap().id;

        let mut tx = Transaction::begin(
            &mut repo,
            &mut TemplateCache::new(1),
            &config,
            1,
            "a",
            Some(ancestor),
        )
        .unwrap();
        let temp = tx.create_record("note").unwrap();
        let fresh = tx.create_record("note").unwrap();
        tx.set_string(&kept, "text", "v2").unwrap();
        tx.add_link(&kept, &fresh, "refers").unwrap();
        let mid = tx.commit(2).unwrap().id;

        let mut tx = Transaction::begin(
            &mut repo,
            &mut TemplateCache::new(1),
            &config,
            1,
            "a",
            Some(mid),
        )
        .unwrap();
        tx.delete_record(&temp).unwrap();
        tx.delete_record(&gone).unwrap();
        let leaf = tx.commit(3).unwrap().id;

        let changes = collect_changes(&repo, &ancestor, &leaf).unwrap();
        assert!(!changes.records.contains_key(&temp));
        assert!(matches!(changes.records.get(&fresh), Some(ChangeSummary::Added(_))));
        assert!(matches!(changes.records.get(&kept), Some(ChangeSummary::Modified(_))));
        assert_eq!(changes.records.get(&gone), Some(&ChangeSummary::Deleted));
        assert_eq!(
            changes.links_added,
            BTreeSet::from([LinkKey::new(kept, fresh, "refers")])
        );
        assert!(changes.links_removed.is_empty());
        assert_eq!(changes.template, None);
    }
}

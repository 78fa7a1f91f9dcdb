// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Common-ancestor search.
//!
//! Both leaves are walked backwards, newest generation first, over every
//! parent edge. The walk is bounded by a window that starts at
//! [`EngineConfig::ancestor_window`] changesets per side and grows by
//! [`EngineConfig::ancestor_window_growth`] after each miss. The shared
//! changeset of highest generation (then lowest id) wins.
use std::collections::{BTreeMap, BinaryHeap};

use tracing::debug;

use super::MergeError;
use crate::config::EngineConfig;
use crate::ident::ChangesetId;
use crate::store::ContentStore;

/// Changesets visited from one leaf, with their generations.
struct Walk {
    seen: BTreeMap<ChangesetId, u64>,
    exhausted: bool,
}

fn walk<S: ContentStore>(store: &S, start: ChangesetId, limit: usize) -> Result<Walk, MergeError> {
    let mut seen = BTreeMap::new();
    let mut queue = BinaryHeap::new();
    let first = store.fetch_changeset(&start)?;
    queue.push((first.generation, start));
    while let Some((generation, id)) = queue.pop() {
        if seen.contains_key(&id) {
            continue;
        }
        if seen.len() == limit {
            return Ok(Walk {
                seen,
                exhausted: false,
            });
        }
        seen.insert(id, generation);
        let cs = store.fetch_changeset(&id)?;
        for parent in &cs.parents {
            if !seen.contains_key(parent) {
                queue.push((store.fetch_changeset(parent)?.generation, *parent));
            }
        }
    }
    Ok(Walk {
        seen,
        exhausted: true,
    })
}

/// Finds the best common ancestor of two changesets.
///
/// # Errors
///
/// [`MergeError::NoAncestorFound`] when both histories are exhausted without
/// meeting, or store failures.
pub(crate) fn find_common_ancestor<S: ContentStore>(
    store: &S,
    config: &EngineConfig,
    a: ChangesetId,
    b: ChangesetId,
) -> Result<ChangesetId, MergeError> {
    let growth = config.ancestor_window_growth.max(2);
    let mut window = config.ancestor_window.max(1);
    loop {
        let left = walk(store, a, window)?;
        let right = walk(store, b, window)?;
        let best = left
            .seen
            .iter()
            .filter(|(id, _)| right.seen.contains_key(id))
            .max_by(|(x_id, x_gen), (y_id, y_gen)| x_gen.cmp(y_gen).then(y_id.cmp(x_id)))
            .map(|(id, _)| *id);
        if let Some(found) = best {
            debug!(ancestor = %found.short(), window, "common ancestor found");
            return Ok(found);
        }
        if left.exhausted && right.exhausted {
            return Err(MergeError::NoAncestorFound { a, b });
        }
        window = window.saturating_mul(growth);
    }
}

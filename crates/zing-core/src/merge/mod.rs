// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Three-way merge of two DAG leaves.
//!
//! The leaves are put in canonical order (lower id first) so merging `a` into
//! `b` and `b` into `a` yield the same changeset. The merge runs as a
//! transaction based on the first leaf with both leaves as parents:
//!
//! 1. find the common ancestor;
//! 2. collect each leaf's net changes since it;
//! 3. classify every record both leaves touched and merge `mod_mod` records
//!    field by field;
//! 4. replay the second leaf's changes (link deletes, record deletes,
//!    adds and modifications, link adds);
//! 5. commit, repairing uniqueness clashes with the fields' `uniqify`
//!    policies between attempts.
//!
//! Conflicts are collected and reported together; a merge either commits
//! completely or writes nothing.
mod ancestor;
mod diff;
mod fields;
mod uniquify;

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, info};
use zing_cas::BlobHash;

use crate::codec::{self, Entry};
use crate::config::EngineConfig;
use crate::constraint::ConstraintViolations;
use crate::db::{template_at, template_by_hash};
use crate::ident::{ChangesetId, DagNum, RecId};
use crate::record::Record;
use crate::store::{Audit, Repository, StoreError};
use crate::template::{AutoMerge, MergeType, Template, TemplateCache, UniquifyOp};
use crate::tx::{CommitAttempt, LinkError, Transaction, TxError};

use diff::{ChangeSummary, LeafChanges};
use fields::{FieldOutcome, FieldSides};

/// Why a record or field of the merge result holds its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeAction {
    /// Record added by the other leaf.
    Added,
    /// Record deleted by the other leaf.
    Deleted,
    /// Field changed only by the other leaf.
    TookTheirs,
    /// Both leaves changed the field; a policy picked the value.
    AutoMerged(AutoMerge),
    /// Calculated field left to be recomputed.
    Recalculated,
    /// Value altered to restore uniqueness.
    Uniquified(UniquifyOp),
}

impl fmt::Display for MergeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => f.write_str("added"),
            Self::Deleted => f.write_str("deleted"),
            Self::TookTheirs => f.write_str("took_theirs"),
            Self::AutoMerged(op) => f.write_str(op.name()),
            Self::Recalculated => f.write_str("recalculated"),
            Self::Uniquified(op) => write!(f, "uniqify:{}", op.name()),
        }
    }
}

/// One automatic decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeLogEntry {
    /// Record concerned.
    pub recid: RecId,
    /// Field concerned; `None` for record-level actions.
    pub field: Option<String>,
    /// Decision taken.
    pub action: MergeAction,
    /// Resulting encoded value, when a field was set.
    pub value: Option<String>,
}

impl fmt::Display for MergeLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.recid)?;
        if let Some(field) = &self.field {
            write!(f, ".{field}")?;
        }
        write!(f, ": {}", self.action)?;
        if let Some(value) = &self.value {
            write!(f, " = {value:?}")?;
        }
        Ok(())
    }
}

/// A change the merge cannot decide.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeConflict {
    /// Both leaves changed a field differently and no policy decided.
    Field {
        /// Record concerned.
        recid: RecId,
        /// Its rectype.
        rectype: String,
        /// Field concerned.
        field: String,
        /// Value at the ancestor.
        ancestor: Option<String>,
        /// Value on the first leaf.
        ours: Option<String>,
        /// Value on the second leaf.
        theirs: Option<String>,
    },
    /// Both leaves changed a `merge_type: record` record differently.
    Record {
        /// Record concerned.
        recid: RecId,
        /// Its rectype.
        rectype: String,
    },
    /// One leaf deleted a record the other modified or linked to.
    DeleteMod {
        /// Record concerned.
        recid: RecId,
    },
    /// Both leaves added the same recid with different content.
    AddAdd {
        /// Record concerned.
        recid: RecId,
    },
    /// Both leaves replaced the template differently.
    Template {
        /// Template of the first leaf.
        ours: BlobHash,
        /// Template of the second leaf.
        theirs: BlobHash,
    },
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field {
                recid,
                rectype,
                field,
                ours,
                theirs,
                ..
            } => write!(
                f,
                "mod_mod on {rectype} {recid}.{field}: {ours:?} vs {theirs:?}"
            ),
            Self::Record { recid, rectype } => write!(f, "mod_mod on {rectype} {recid}"),
            Self::DeleteMod { recid } => write!(f, "delete_mod on {recid}"),
            Self::AddAdd { recid } => write!(f, "add_add on {recid}"),
            Self::Template { ours, theirs } => {
                write!(f, "template {} vs {}", ours.short(), theirs.short())
            }
        }
    }
}

/// Merge failures. Nothing is written when a merge fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    /// Both leaves are the same changeset.
    #[error("[MERGE_IDENTICAL] both leaves are {0}")]
    IdenticalLeaves(ChangesetId),
    /// The leaves share no history.
    #[error("[MERGE_NO_ANCESTOR] {a} and {b} have no common ancestor")]
    NoAncestorFound {
        /// First leaf.
        a: ChangesetId,
        /// Second leaf.
        b: ChangesetId,
    },
    /// Changes that need a human decision.
    #[error("[MERGE_CONFLICT] {} conflict(s), first: {}", .0.len(), .0.first().map(ToString::to_string).unwrap_or_default())]
    Conflicts(Vec<MergeConflict>),
    /// The merged state violates constraints no policy can repair.
    #[error("[MERGE_UNRESOLVABLE] {0}")]
    Unresolvable(ConstraintViolations),
    /// Uniquify kept producing violations.
    #[error("[MERGE_UNIQUIFY_EXHAUSTED] still violating after {0} repair rounds")]
    UniquifyExhausted(usize),
    /// Transaction failure.
    #[error(transparent)]
    Tx(#[from] TxError),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A committed merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Merge changeset.
    pub changeset: ChangesetId,
    /// Common ancestor the merge was computed against.
    pub ancestor: ChangesetId,
    /// Leaves in canonical order; the first is the merge's baseline.
    pub leaves: [ChangesetId; 2],
    /// Every automatic decision, in application order.
    pub log: Vec<MergeLogEntry>,
}

/// Record-level work derived from the second leaf's changes.
#[derive(Default)]
struct Plan {
    adopt: Vec<Record>,
    delete: Vec<RecId>,
    overwrite: Vec<(RecId, BTreeMap<String, String>)>,
    recalc: Vec<RecId>,
    log: Vec<MergeLogEntry>,
    conflicts: Vec<MergeConflict>,
}

struct Context<'s, S> {
    store: &'s S,
    template: Option<&'s Template>,
    ancestor: ChangesetId,
    leaf_times: [i64; 2],
}

impl<S: Repository> Context<'_, S> {
    fn record(&self, hash: &BlobHash) -> Result<Record, StoreError> {
        match codec::decode_entry(&self.store.fetch_blob(hash)?)? {
            Entry::Record(record) => Ok(record),
            Entry::Link(_) => Err(StoreError::Corrupt(format!(
                "blob {hash} is a link, expected a record"
            ))),
        }
    }

    /// When `hash` became live, falling back to the leaf's own time.
    fn changed_at(&self, recid: &RecId, hash: &BlobHash, side: usize) -> Result<i64, StoreError> {
        Ok(self
            .store
            .record_history(recid)?
            .iter()
            .find(|h| h.hash == *hash)
            .map_or(self.leaf_times[side], |h| h.audit.when))
    }

    fn plan(&self, ours: &LeafChanges, theirs: &LeafChanges) -> Result<Plan, StoreError> {
        let mut plan = Plan::default();
        for (recid, change) in &theirs.records {
            match (ours.records.get(recid), *change) {
                (None, ChangeSummary::Added(h)) => {
                    plan.adopt.push(self.record(&h)?);
                    plan.log.push(entry(recid, None, MergeAction::Added, None));
                }
                (None, ChangeSummary::Deleted) => {
                    plan.delete.push(recid.clone());
                    plan.log.push(entry(recid, None, MergeAction::Deleted, None));
                }
                (None, ChangeSummary::Modified(h)) => {
                    let record = self.record(&h)?;
                    plan.log.push(entry(recid, None, MergeAction::TookTheirs, None));
                    plan.overwrite.push((recid.clone(), record.fields().clone()));
                }
                (Some(ChangeSummary::Deleted), ChangeSummary::Deleted) => {}
                (Some(mine), change) if mine.hash() == change.hash() => {}
                (Some(ChangeSummary::Deleted), ChangeSummary::Modified(_))
                | (Some(ChangeSummary::Modified(_)), ChangeSummary::Deleted) => {
                    plan.conflicts.push(MergeConflict::DeleteMod {
                        recid: recid.clone(),
                    });
                }
                (Some(ChangeSummary::Modified(x)), ChangeSummary::Modified(y)) => {
                    self.mod_mod(recid, *x, y, &mut plan)?;
                }
                _ => plan.conflicts.push(MergeConflict::AddAdd {
                    recid: recid.clone(),
                }),
            }
        }
        Ok(plan)
    }

    fn mod_mod(
        &self,
        recid: &RecId,
        ours_hash: BlobHash,
        theirs_hash: BlobHash,
        plan: &mut Plan,
    ) -> Result<(), StoreError> {
        let ours = self.record(&ours_hash)?;
        let theirs = self.record(&theirs_hash)?;
        let base = match self.store.resolve_current_hash(recid, Some(&self.ancestor))? {
            Some(h) => self.record(&h)?.fields().clone(),
            None => BTreeMap::new(),
        };
        let rectype = ours.rectype().to_owned();
        let rt = self.template.and_then(|t| t.rectype(&rectype));
        if rt.is_some_and(|rt| rt.merge_type == MergeType::Record) {
            plan.conflicts.push(MergeConflict::Record {
                recid: recid.clone(),
                rectype,
            });
            return Ok(());
        }
        let ours_when = self.changed_at(recid, &ours_hash, 0)?;
        let theirs_when = self.changed_at(recid, &theirs_hash, 1)?;
        let mut names: Vec<&String> = base
            .keys()
            .chain(ours.fields().keys())
            .chain(theirs.fields().keys())
            .collect();
        names.sort_unstable();
        names.dedup();

        let mut merged = ours.fields().clone();
        let mut conflicted = false;
        let mut recalc = false;
        for name in names {
            let attrs = self.template.and_then(|t| t.field_attributes(&rectype, name));
            let sides = FieldSides {
                ancestor: base.get(name).map(String::as_str),
                ours: ours.get(name),
                theirs: theirs.get(name),
                ours_when,
                theirs_when,
            };
            if attrs.as_ref().is_some_and(|a| a.calculated.is_some()) {
                if sides.ours != sides.theirs {
                    recalc = true;
                    plan.log.push(entry(
                        recid,
                        Some(name),
                        MergeAction::Recalculated,
                        None,
                    ));
                }
                continue;
            }
            let policies = attrs.as_ref().map_or(&[][..], |a| a.auto_merge.as_slice());
            let value = match fields::merge_field(&sides, policies) {
                FieldOutcome::Ours => continue,
                FieldOutcome::Theirs => {
                    let value = sides.theirs.map(str::to_owned);
                    plan.log.push(entry(
                        recid,
                        Some(name),
                        MergeAction::TookTheirs,
                        value.clone(),
                    ));
                    value
                }
                FieldOutcome::Auto(op, value) => {
                    debug!(%recid, field = %name, op = op.name(), "field automerged");
                    plan.log.push(entry(
                        recid,
                        Some(name),
                        MergeAction::AutoMerged(op),
                        value.clone(),
                    ));
                    value
                }
                FieldOutcome::Conflict => {
                    conflicted = true;
                    plan.conflicts.push(MergeConflict::Field {
                        recid: recid.clone(),
                        rectype: rectype.clone(),
                        field: name.clone(),
                        ancestor: sides.ancestor.map(str::to_owned),
                        ours: sides.ours.map(str::to_owned),
                        theirs: sides.theirs.map(str::to_owned),
                    });
                    continue;
                }
            };
            match value {
                Some(v) => merged.insert(name.clone(), v),
                None => merged.remove(name.as_str()),
            };
        }
        if conflicted {
            return Ok(());
        }
        if &merged != ours.fields() {
            plan.overwrite.push((recid.clone(), merged));
        }
        if recalc {
            plan.recalc.push(recid.clone());
        }
        Ok(())
    }
}

fn entry(
    recid: &RecId,
    field: Option<&String>,
    action: MergeAction,
    value: Option<String>,
) -> MergeLogEntry {
    MergeLogEntry {
        recid: recid.clone(),
        field: field.cloned(),
        action,
        value,
    }
}

/// Merges leaves `a` and `b` of `dagnum` into one changeset authored by
/// `audit`.
///
/// # Errors
///
/// [`MergeError::IdenticalLeaves`], [`MergeError::NoAncestorFound`],
/// [`MergeError::Conflicts`] listing every undecidable change,
/// [`MergeError::Unresolvable`] or [`MergeError::UniquifyExhausted`] when the
/// result cannot satisfy its constraints, and store failures.
pub fn attempt_automatic_merge<S: Repository>(
    store: &mut S,
    cache: &mut TemplateCache,
    config: &EngineConfig,
    dagnum: DagNum,
    a: ChangesetId,
    b: ChangesetId,
    audit: &Audit,
) -> Result<MergeOutcome, MergeError> {
    if a == b {
        return Err(MergeError::IdenticalLeaves(a));
    }
    let leaves = if a < b { [a, b] } else { [b, a] };
    let mut leaf_times = [0; 2];
    for (slot, leaf) in leaves.iter().enumerate() {
        let cs = store.fetch_changeset(leaf)?;
        if cs.dagnum != dagnum {
            return Err(StoreError::DagMismatch {
                parent: *leaf,
                expected: dagnum,
                found: cs.dagnum,
            }
            .into());
        }
        leaf_times[slot] = cs.audit.when;
    }
    let ancestor = ancestor::find_common_ancestor(&*store, config, leaves[0], leaves[1])?;
    let ours = diff::collect_changes(&*store, &ancestor, &leaves[0])?;
    let theirs = diff::collect_changes(&*store, &ancestor, &leaves[1])?;

    let mut conflicts = Vec::new();
    let base_template = template_at(&*store, cache, Some(&leaves[0]))?;
    let their_template = match (ours.template, theirs.template) {
        (Some(x), Some(y)) if x != y => {
            conflicts.push(MergeConflict::Template { ours: x, theirs: y });
            None
        }
        (None, Some(y)) => Some(template_by_hash(&*store, cache, &y)?),
        _ => None,
    };
    let effective = their_template.clone().or_else(|| base_template.clone());

    let ctx = Context {
        store: &*store,
        template: effective.as_deref(),
        ancestor,
        leaf_times,
    };
    let plan = ctx.plan(&ours, &theirs)?;
    debug!(
        ancestor = %ancestor.short(),
        ours = ours.records.len(),
        theirs = theirs.records.len(),
        conflicts = plan.conflicts.len(),
        "merge classified"
    );
    conflicts.extend(plan.conflicts);
    if !conflicts.is_empty() {
        return Err(MergeError::Conflicts(conflicts));
    }

    let mut log = plan.log;
    let mut tx = Transaction::with_template(
        store,
        config,
        dagnum,
        audit.who.clone(),
        Some(leaves[0]),
        base_template,
    );
    tx.add_parent(leaves[1]);
    if let Some(template) = their_template {
        tx.replace_template(template);
    }
    for link in &theirs.links_removed {
        if tx.link_exists(link)? {
            tx.unstage_link(link)?;
        }
    }
    for recid in &plan.delete {
        match tx.delete_record(recid) {
            Ok(()) => {}
            Err(TxError::Link(LinkError::CannotDeleteRecordWithLinksToIt { .. })) => {
                conflicts.push(MergeConflict::DeleteMod {
                    recid: recid.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
    for record in &plan.adopt {
        tx.adopt_record(record)?;
    }
    for (recid, fields) in plan.overwrite {
        tx.overwrite_fields(&recid, fields)?;
    }
    for recid in &plan.recalc {
        tx.dirty_calculations(recid)?;
    }
    for link in &theirs.links_added {
        if tx.link_exists(link)? {
            continue;
        }
        let mut endpoints_live = true;
        for end in [&link.from, &link.to] {
            if !tx.is_live(end)? {
                endpoints_live = false;
                conflicts.push(MergeConflict::DeleteMod { recid: end.clone() });
            }
        }
        if endpoints_live {
            tx.stage_link(link)?;
        }
    }
    if !conflicts.is_empty() {
        tx.abort();
        return Err(MergeError::Conflicts(conflicts));
    }

    let rounds = config.max_uniquify_rounds;
    let mut round = 0;
    loop {
        match tx.try_commit(audit.when)? {
            CommitAttempt::Committed(done) => {
                info!(
                    dagnum,
                    changeset = %done.id.short(),
                    ancestor = %ancestor.short(),
                    decisions = log.len(),
                    "leaves merged"
                );
                return Ok(MergeOutcome {
                    changeset: done.id,
                    ancestor,
                    leaves,
                    log,
                });
            }
            CommitAttempt::Violations(violations) => {
                if round == rounds {
                    tx.abort();
                    return Err(MergeError::UniquifyExhausted(rounds));
                }
                round += 1;
                if !uniquify::repair(&mut tx, &violations, &mut log)? {
                    tx.abort();
                    return Err(MergeError::Unresolvable(violations));
                }
            }
        }
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Commit pipeline: template re-check, actions, constraints, staging.
use std::collections::BTreeMap;

use tracing::{debug, info, warn};
use zing_cas::{blob_hash, BlobHash};

use super::{LinkError, Transaction, TxError, TxState};
use crate::codec::{self, ChangesetDelta, DELTA_VERSION};
use crate::constraint::{ConstraintViolations, Violation, ViolationKind};
use crate::ident::{ChangesetId, RecId};
use crate::index::{LinkFilter, Predicate};
use crate::store::{Audit, CommitBatch, Repository};
use crate::template::LinkEnd;

/// A successful commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Committed {
    /// Changeset now holding the transaction's state.
    pub id: ChangesetId,
    /// `false` when nothing changed and the baseline was returned as is.
    pub created: bool,
}

/// Outcome of [`Transaction::try_commit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitAttempt {
    /// Written.
    Committed(Committed),
    /// Constraints failed; the transaction is open again.
    Violations(ConstraintViolations),
}

impl<S: Repository> Transaction<'_, S> {
    /// Commits, turning constraint violations into an error and aborting.
    ///
    /// # Errors
    ///
    /// [`TxError::ConstraintViolations`], or any failure of
    /// [`try_commit`](Self::try_commit).
    pub fn commit(mut self, when: i64) -> Result<Committed, TxError> {
        match self.try_commit(when)? {
            CommitAttempt::Committed(done) => Ok(done),
            CommitAttempt::Violations(violations) => {
                self.abort();
                Err(TxError::ConstraintViolations(violations))
            }
        }
    }

    /// Runs the commit pipeline. Violations reopen the transaction so the
    /// caller can repair and retry; any other failure aborts it.
    ///
    /// # Errors
    ///
    /// [`TxError::NotOpen`], action or store failures.
    pub fn try_commit(&mut self, when: i64) -> Result<CommitAttempt, TxError> {
        self.ensure_open()?;
        self.state = TxState::Validating;
        match self.run_commit(when) {
            Ok(CommitAttempt::Violations(violations)) => {
                warn!(
                    dagnum = self.dagnum,
                    count = violations.len(),
                    "commit rejected: {violations}"
                );
                self.state = TxState::Open;
                Ok(CommitAttempt::Violations(violations))
            }
            Ok(done) => {
                self.release(TxState::Committed);
                Ok(done)
            }
            Err(e) => {
                warn!(dagnum = self.dagnum, error = %e, "commit failed; transaction aborted");
                self.release(TxState::Aborted);
                Err(e)
            }
        }
    }

    fn run_commit(&mut self, when: i64) -> Result<CommitAttempt, TxError> {
        if self.template_replaced {
            self.recheck_touched()?;
        }
        self.perform_actions()?;
        let violations = self.check_constraints()?;
        if !violations.is_empty() {
            return Ok(CommitAttempt::Violations(violations));
        }
        let audit = Audit::new(self.who.clone(), when);
        let Some(batch) = self.stage(audit)? else {
            let id = self.baseline.ok_or(TxError::NoTemplate)?;
            debug!(changeset = %id.short(), "nothing to commit");
            return Ok(CommitAttempt::Committed(Committed { id, created: false }));
        };
        let (adds, removes) = (batch.delta.add.len(), batch.delta.remove.len());
        let id = self.store.create_changeset(batch)?;
        info!(
            dagnum = self.dagnum,
            changeset = %id.short(),
            parents = self.parents.len(),
            adds,
            removes,
            who = %self.who,
            "changeset committed"
        );
        Ok(CommitAttempt::Committed(Committed { id, created: true }))
    }

    /// Loads every live record whose rectype the template change touched so
    /// that the constraint pass sees it, and dirties calculated fields whose
    /// definitions may have changed.
    fn recheck_touched(&mut self) -> Result<(), TxError> {
        let template = self.require_template()?;
        let touched = template.touched_rectypes(self.base_template.as_deref());
        for rectype in &touched {
            let live = self
                .store
                .query(&Predicate::rectype(rectype.as_str()), self.baseline.as_ref())?;
            for recid in live {
                self.load(&recid)?;
                self.recheck.insert(recid);
            }
        }
        let held: Vec<(RecId, String)> = self
            .records
            .values()
            .filter(|r| !r.deleted && touched.contains(r.rectype()))
            .map(|r| (r.recid().clone(), r.rectype().to_owned()))
            .collect();
        for dep in self.dependencies.values_mut() {
            for (recid, rectype) in &held {
                if dep.calcs.iter().any(|c| c.rectype == *rectype) {
                    dep.dirty.insert(recid.clone());
                }
            }
        }
        debug!(rectypes = touched.len(), records = self.recheck.len(), "template re-check");
        Ok(())
    }

    /// Commit-time constraint pass over every dirtied record.
    pub(crate) fn check_constraints(&self) -> Result<ConstraintViolations, TxError> {
        let Some(template) = self.template.clone() else {
            return Ok(ConstraintViolations::default());
        };
        let mut out = Vec::new();
        let mut unique: BTreeMap<(String, String, String), RecId> = BTreeMap::new();
        for record in self.records.values() {
            let recid = record.recid();
            let touched = record.is_dirty() || record.dirty_links || self.recheck.contains(recid);
            if record.deleted || !touched {
                continue;
            }
            let Some(rt) = template.rectype(record.rectype()) else {
                out.push(Violation::record(
                    ViolationKind::UnknownRectype,
                    recid,
                    record.rectype(),
                ));
                continue;
            };
            for (name, value) in record.fields() {
                if !rt.fields.contains_key(name) {
                    out.push(Violation::field(
                        ViolationKind::UnknownField,
                        recid,
                        &rt.name,
                        name,
                        Some(value),
                    ));
                }
            }
            for name in rt.fields.keys() {
                let Some(attrs) = template.field_attributes(&rt.name, name) else {
                    continue;
                };
                match record.get(name) {
                    None if attrs.required => out.push(Violation::field(
                        ViolationKind::Required,
                        recid,
                        &rt.name,
                        name,
                        None,
                    )),
                    None => {}
                    Some(value) => {
                        if let Err(kind) = attrs.check_encoded(value) {
                            out.push(Violation::field(kind, recid, &rt.name, name, Some(value)));
                        }
                        if attrs.unique {
                            unique
                                .entry((rt.name.clone(), name.clone(), value.to_owned()))
                                .or_insert_with(|| recid.clone());
                        }
                    }
                }
            }
            for (lt, end) in template.link_ends(&rt.name) {
                let side = lt.side(end);
                if !side.required && !side.singular {
                    continue;
                }
                let filter = match end {
                    LinkEnd::From => LinkFilter::outgoing(recid),
                    LinkEnd::To => LinkFilter::incoming(recid),
                }
                .named(lt.name.as_str());
                let count = self.current_links(&filter)?.len();
                if side.required && count == 0 {
                    out.push(Violation::field(
                        ViolationKind::RequiredLink,
                        recid,
                        &rt.name,
                        &lt.name,
                        None,
                    ));
                }
                if side.singular && count > 1 {
                    out.push(Violation::field(
                        ViolationKind::SingularLink,
                        recid,
                        &rt.name,
                        &lt.name,
                        Some(&count.to_string()),
                    ));
                }
            }
        }
        for ((rectype, field, value), first) in unique {
            let holders = self.value_holders(&rectype, &field, &value)?;
            if holders.len() > 1 {
                let mut violation = Violation::field(
                    ViolationKind::Unique,
                    &first,
                    &rectype,
                    &field,
                    Some(&value),
                );
                violation.conflicting = holders;
                out.push(violation);
            }
        }
        Ok(ConstraintViolations(out))
    }

    /// Builds the batch for this commit; `None` when the commit would be a
    /// no-op on an existing baseline.
    fn stage(&self, audit: Audit) -> Result<Option<CommitBatch>, TxError> {
        let mut add: Vec<BlobHash> = Vec::new();
        let mut remove: Vec<BlobHash> = Vec::new();
        let mut blobs = Vec::new();
        for record in self.records.values() {
            if record.deleted {
                remove.extend(record.original_hash());
                continue;
            }
            if !record.is_dirty() {
                continue;
            }
            let bytes = codec::encode_record(record);
            let hash = blob_hash(&bytes);
            if record.original_hash() == Some(hash) {
                continue;
            }
            remove.extend(record.original_hash());
            add.push(hash);
            blobs.push(bytes);
        }
        for link in &self.links_new {
            let bytes = codec::encode_link(link);
            add.push(blob_hash(&bytes));
            blobs.push(bytes);
        }
        for link in &self.links_delete {
            let hash = self
                .store
                .resolve_link_hash(link, self.baseline.as_ref())?
                .ok_or_else(|| LinkError::LinkNotFound(link.clone()))?;
            remove.push(hash);
        }
        let base_hash = self.base_template.as_ref().map(|t| t.hash());
        let template = match &self.template {
            Some(t) if self.template_replaced && base_hash != Some(t.hash()) => {
                blobs.push(t.canonical_bytes().to_vec());
                Some(t.hash())
            }
            _ => None,
        };
        add.sort_unstable();
        remove.sort_unstable();
        let delta = ChangesetDelta {
            version: DELTA_VERSION,
            baseline: self.baseline,
            template,
            add,
            remove,
        };
        if delta.is_empty() && self.parents.len() <= 1 && self.baseline.is_some() {
            return Ok(None);
        }
        Ok(Some(CommitBatch {
            dagnum: self.dagnum,
            parents: self.parents.clone(),
            delta,
            blobs,
            audit,
        }))
    }
}

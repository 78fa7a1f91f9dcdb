// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Staging transactions.
//!
//! A [`Transaction`] collects record and link mutations against one baseline
//! changeset (or none, for a DAG's first commit). Setters type-check and run
//! the cheap inline constraints immediately; required fields, uniqueness and
//! link cardinality wait for commit, where calculated fields are brought to a
//! fixed point first and everything is written as one changeset.
//!
//! # State machine
//!
//! `Open → Validating → Committed`, with `Validating → Open` when a
//! [`try_commit`](Transaction::try_commit) reports violations, and `Aborted`
//! reachable from any state via [`abort`](Transaction::abort) or a failed
//! commit. Every mutating operation requires `Open`.
mod actions;
mod commit;
mod generate;
mod links;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

use crate::codec::{self, Entry};
use crate::config::EngineConfig;
use crate::constraint::{ConstraintViolations, Violation};
use crate::db::template_at;
use crate::ident::{ChangesetId, DagNum, RecId};
use crate::index::{LinkFilter, Predicate};
use crate::record::{is_reserved, LinkKey, Record};
use crate::store::{Repository, StoreError};
use crate::template::{
    Builtin, DefaultSpec, FieldAttributes, SchemaError, Template, TemplateCache,
};
use crate::value::{DataType, Value, ValueError};

pub(crate) use actions::{dependencies_of, DependencyInfo};
pub use commit::{CommitAttempt, Committed};
pub(crate) use generate::inc_digits_end;
pub use links::LinkError;

/// Lifecycle state of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    /// Accepting mutations.
    Open,
    /// Inside a commit.
    Validating,
    /// Written; no further use.
    Committed,
    /// Discarded; no further use.
    Aborted,
}

/// Transaction failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    /// The transaction is not `Open`.
    #[error("[TX_NOT_OPEN] transaction is {0:?}")]
    NotOpen(TxState),
    /// The DAG has no template yet.
    #[error("[TX_NO_TEMPLATE] no template at this state")]
    NoTemplate,
    /// Rectype not in the template.
    #[error("[TX_UNKNOWN_RECTYPE] unknown rectype `{0}`")]
    UnknownRectype(String),
    /// Field not declared on the record's rectype.
    #[error("[TX_UNKNOWN_FIELD] `{rectype}` has no field `{field}`")]
    UnknownField {
        /// Rectype of the record.
        rectype: String,
        /// Field requested.
        field: String,
    },
    /// Field name reserved by the engine.
    #[error("[TX_RESERVED_FIELD] `{0}` is reserved")]
    ReservedField(String),
    /// Calculated fields are maintained by the engine.
    #[error("[TX_CALCULATED_FIELD] `{rectype}.{field}` is calculated")]
    CalculatedField {
        /// Rectype of the record.
        rectype: String,
        /// Field requested.
        field: String,
    },
    /// Value of the wrong datatype.
    #[error("[TX_TYPE_MISMATCH] `{field}` expects {expected}, got {found}")]
    TypeMismatch {
        /// Field being set.
        field: String,
        /// Declared datatype.
        expected: DataType,
        /// Datatype supplied.
        found: DataType,
    },
    /// Record not live at the baseline or deleted in this transaction.
    #[error("[TX_RECORD_NOT_FOUND] {0}")]
    RecordNotFound(RecId),
    /// Rectype declared `no_recid`.
    #[error("[TX_NO_RECID_DELETE] records of `{0}` cannot be deleted")]
    NoRecidDelete(String),
    /// An inline check failed while setting a field.
    #[error("[TX_CONSTRAINT] {0}")]
    Constraint(Violation),
    /// Commit-time checks failed.
    #[error("[TX_CONSTRAINTS] {0}")]
    ConstraintViolations(ConstraintViolations),
    /// Link operation failed.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// Calculated fields kept changing.
    #[error("[TX_ACTIONS_DIVERGED] calculated fields still changing after {0} passes")]
    ActionsDidNotConverge(usize),
    /// A generator could not find a free value.
    #[error("[TX_GENERATOR_EXHAUSTED] no free value for `{rectype}.{field}` after {attempts} attempts")]
    GeneratorExhausted {
        /// Rectype of the field.
        rectype: String,
        /// Field being generated.
        field: String,
        /// Candidates tried.
        attempts: usize,
    },
    /// The DAG has several leaves; reading or committing needs a merge first.
    #[error("[TX_NEEDS_MERGE] dag {dagnum} has {} leaves", leaves.len())]
    NeedsMerge {
        /// DAG concerned.
        dagnum: DagNum,
        /// Current leaves.
        leaves: Vec<ChangesetId>,
    },
    /// Template rejected.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Stored value does not decode.
    #[error(transparent)]
    Value(#[from] ValueError),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A staging transaction over a [`Repository`].
///
/// The transaction holds the store mutably for its whole life.
pub struct Transaction<'a, S> {
    store: &'a mut S,
    config: &'a EngineConfig,
    dagnum: DagNum,
    who: String,
    baseline: Option<ChangesetId>,
    parents: Vec<ChangesetId>,
    template: Option<Arc<Template>>,
    base_template: Option<Arc<Template>>,
    template_replaced: bool,
    records: BTreeMap<RecId, Record>,
    links_new: BTreeSet<LinkKey>,
    links_delete: BTreeSet<LinkKey>,
    dependencies: BTreeMap<String, DependencyInfo>,
    recheck: BTreeSet<RecId>,
    state: TxState,
}

impl<'a, S: Repository> Transaction<'a, S> {
    /// Opens a transaction on `baseline` with the template in effect there,
    /// loaded through `cache`. With no baseline (or no template) the
    /// transaction starts schema-less and can only install a template.
    ///
    /// # Errors
    ///
    /// Store failures, or a stored template that no longer validates.
    pub fn begin(
        store: &'a mut S,
        cache: &mut TemplateCache,
        config: &'a EngineConfig,
        dagnum: DagNum,
        who: impl Into<String>,
        baseline: Option<ChangesetId>,
    ) -> Result<Self, TxError> {
        let template = template_at(&*store, cache, baseline.as_ref())?;
        Ok(Self::with_template(store, config, dagnum, who, baseline, template))
    }

    pub(crate) fn with_template(
        store: &'a mut S,
        config: &'a EngineConfig,
        dagnum: DagNum,
        who: impl Into<String>,
        baseline: Option<ChangesetId>,
        template: Option<Arc<Template>>,
    ) -> Self {
        let dependencies = template
            .as_deref()
            .map(dependencies_of)
            .unwrap_or_default();
        debug!(
            dagnum,
            baseline = ?baseline.map(|b| b.short()),
            "transaction opened"
        );
        Self {
            store,
            config,
            dagnum,
            who: who.into(),
            parents: baseline.into_iter().collect(),
            baseline,
            base_template: template.clone(),
            template,
            template_replaced: false,
            records: BTreeMap::new(),
            links_new: BTreeSet::new(),
            links_delete: BTreeSet::new(),
            dependencies,
            recheck: BTreeSet::new(),
            state: TxState::Open,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// DAG this transaction commits into.
    pub fn dagnum(&self) -> DagNum {
        self.dagnum
    }

    /// Acting user.
    pub fn who(&self) -> &str {
        &self.who
    }

    /// Baseline changeset.
    pub fn baseline(&self) -> Option<&ChangesetId> {
        self.baseline.as_ref()
    }

    /// Declared parents, baseline first.
    pub fn parents(&self) -> &[ChangesetId] {
        &self.parents
    }

    /// Template in effect (possibly replaced in this transaction).
    pub fn template(&self) -> Option<&Arc<Template>> {
        self.template.as_ref()
    }

    /// Read access to the underlying store.
    pub fn store(&self) -> &S {
        self.store
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        self.config
    }

    /// Declares an extra parent (merge commits).
    pub(crate) fn add_parent(&mut self, parent: ChangesetId) {
        if !self.parents.contains(&parent) {
            self.parents.push(parent);
        }
    }

    /// Records currently held by the transaction that are not deleted.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|r| !r.deleted)
    }

    /// Replaces the template for this transaction. The new template is
    /// validated now; records it affects are re-checked at commit.
    ///
    /// # Errors
    ///
    /// [`TxError::Schema`] if the document is invalid.
    pub fn set_template(&mut self, raw: &[u8]) -> Result<(), TxError> {
        self.ensure_open()?;
        let template = Template::parse(raw)?;
        self.replace_template(Arc::new(template));
        Ok(())
    }

    pub(crate) fn replace_template(&mut self, template: Arc<Template>) {
        debug!(template = %template.hash().short(), "template replaced");
        self.dependencies = dependencies_of(&template);
        self.template = Some(template);
        self.template_replaced = true;
    }

    /// Creates a record of `rectype` with a fresh recid and its defaults
    /// applied. Generated defaults avoid every live value of the field.
    ///
    /// # Errors
    ///
    /// Unknown rectype, no template, or an exhausted generator.
    pub fn create_record(&mut self, rectype: &str) -> Result<RecId, TxError> {
        self.ensure_open()?;
        let template = self.require_template()?;
        let rt = template
            .rectype(rectype)
            .ok_or_else(|| TxError::UnknownRectype(rectype.to_owned()))?;
        let recid = RecId::generate();
        let mut record = Record::new(recid.clone(), rectype);
        for (name, spec) in &rt.fields {
            let initial = if let Some(calc) = &spec.calculated {
                matches!(calc.builtin, Builtin::Sum | Builtin::Count).then(|| "0".to_owned())
            } else {
                match &spec.constraints.default {
                    None => None,
                    Some(DefaultSpec::Literal(value)) => Some(value.encode()),
                    Some(DefaultSpec::Now) => Some(unix_now().to_string()),
                    Some(DefaultSpec::WhoAmI) => Some(self.who.clone()),
                    Some(DefaultSpec::Generate(generator)) => {
                        Some(self.generate_unique(rectype, name, generator)?)
                    }
                }
            };
            if initial.is_some() {
                record.put(name, initial);
            }
        }
        debug!(%recid, rectype, "record created");
        self.records.insert(recid.clone(), record);
        Ok(recid)
    }

    /// The transaction's copy of `recid`, loading it from the baseline on
    /// first access.
    ///
    /// # Errors
    ///
    /// [`TxError::RecordNotFound`] if the record is not live.
    pub fn get_record(&mut self, recid: &RecId) -> Result<&Record, TxError> {
        self.ensure_open()?;
        self.live_record_mut(recid).map(|r| &*r)
    }

    /// Typed value of `field`, `None` when unset.
    ///
    /// # Errors
    ///
    /// Missing record, unknown field, or a stored value that does not decode.
    pub fn value(&mut self, recid: &RecId, field: &str) -> Result<Option<Value>, TxError> {
        let template = self.require_template()?;
        let record = self.get_record(recid)?;
        let attrs = template
            .field_attributes(record.rectype(), field)
            .ok_or_else(|| TxError::UnknownField {
                rectype: record.rectype().to_owned(),
                field: field.to_owned(),
            })?;
        Ok(record
            .get(field)
            .map(|text| Value::decode(attrs.datatype, text))
            .transpose()?)
    }

    /// Sets a field. The value must match the declared datatype and pass the
    /// inline constraints; required and unique are checked at commit.
    ///
    /// # Errors
    ///
    /// Reserved, unknown or calculated field, [`TxError::TypeMismatch`], or
    /// [`TxError::Constraint`] for a failed inline check.
    pub fn set_field(&mut self, recid: &RecId, field: &str, value: Value) -> Result<(), TxError> {
        self.ensure_open()?;
        let attrs = self.settable_attributes(recid, field)?;
        if value.datatype() != attrs.datatype {
            return Err(TxError::TypeMismatch {
                field: field.to_owned(),
                expected: attrs.datatype,
                found: value.datatype(),
            });
        }
        let encoded = value.encode();
        attrs.check_value(&value).map_err(|kind| {
            TxError::Constraint(Violation::field(
                kind,
                recid,
                &attrs.rectype,
                field,
                Some(&encoded),
            ))
        })?;
        self.write_field(recid, field, Some(encoded))?;
        Ok(())
    }

    /// Sets an `int` field.
    ///
    /// # Errors
    ///
    /// As [`set_field`](Self::set_field).
    pub fn set_int(&mut self, recid: &RecId, field: &str, value: i64) -> Result<(), TxError> {
        self.set_field(recid, field, Value::Int(value))
    }

    /// Sets a `string` field.
    ///
    /// # Errors
    ///
    /// As [`set_field`](Self::set_field).
    pub fn set_string(&mut self, recid: &RecId, field: &str, value: &str) -> Result<(), TxError> {
        self.set_field(recid, field, Value::String(value.to_owned()))
    }

    /// Sets a `bool` field.
    ///
    /// # Errors
    ///
    /// As [`set_field`](Self::set_field).
    pub fn set_bool(&mut self, recid: &RecId, field: &str, value: bool) -> Result<(), TxError> {
        self.set_field(recid, field, Value::Bool(value))
    }

    /// Sets a `datetime` field (Unix seconds).
    ///
    /// # Errors
    ///
    /// As [`set_field`](Self::set_field).
    pub fn set_datetime(&mut self, recid: &RecId, field: &str, value: i64) -> Result<(), TxError> {
        self.set_field(recid, field, Value::DateTime(value))
    }

    /// Removes a field's value.
    ///
    /// # Errors
    ///
    /// Reserved, unknown or calculated field, or a missing record.
    pub fn clear_field(&mut self, recid: &RecId, field: &str) -> Result<(), TxError> {
        self.ensure_open()?;
        self.settable_attributes(recid, field)?;
        self.write_field(recid, field, None)?;
        Ok(())
    }

    /// Marks a record deleted and stages removal of every link leaving it.
    ///
    /// # Errors
    ///
    /// [`TxError::NoRecidDelete`] for `no_recid` rectypes and
    /// [`LinkError::CannotDeleteRecordWithLinksToIt`] while other records
    /// link to it.
    pub fn delete_record(&mut self, recid: &RecId) -> Result<(), TxError> {
        self.ensure_open()?;
        let template = self.require_template()?;
        let rectype = self.live_record_mut(recid)?.rectype().to_owned();
        if template.rectype(&rectype).is_some_and(|rt| rt.no_recid) {
            return Err(TxError::NoRecidDelete(rectype));
        }
        let incoming = self
            .current_links(&LinkFilter::incoming(recid))?
            .into_iter()
            .filter(|link| link.from != *recid)
            .count();
        if incoming > 0 {
            return Err(LinkError::CannotDeleteRecordWithLinksToIt {
                recid: recid.clone(),
                count: incoming,
            }
            .into());
        }
        for link in self.current_links(&LinkFilter::outgoing(recid))? {
            self.unstage_link(&link)?;
        }
        self.live_record_mut(recid)?.deleted = true;
        debug!(%recid, rectype, "record deleted");
        Ok(())
    }

    /// Discards every staged change. The transaction cannot be used again.
    pub fn abort(&mut self) {
        if self.state != TxState::Committed {
            debug!(dagnum = self.dagnum, "transaction aborted");
            self.release(TxState::Aborted);
        }
    }

    pub(crate) fn release(&mut self, state: TxState) {
        self.records.clear();
        self.links_new.clear();
        self.links_delete.clear();
        self.recheck.clear();
        for dep in self.dependencies.values_mut() {
            dep.froms.clear();
            dep.dirty.clear();
        }
        self.state = state;
    }

    pub(crate) fn ensure_open(&self) -> Result<(), TxError> {
        if self.state == TxState::Open {
            Ok(())
        } else {
            Err(TxError::NotOpen(self.state))
        }
    }

    pub(crate) fn require_template(&self) -> Result<Arc<Template>, TxError> {
        self.template.clone().ok_or(TxError::NoTemplate)
    }

    /// Loads `recid` from the baseline into the transaction if absent.
    /// Deleted records stay loaded (and deleted).
    pub(crate) fn load(&mut self, recid: &RecId) -> Result<(), TxError> {
        if self.records.contains_key(recid) {
            return Ok(());
        }
        let hash = self
            .store
            .resolve_current_hash(recid, self.baseline.as_ref())?
            .ok_or_else(|| TxError::RecordNotFound(recid.clone()))?;
        let bytes = self.store.fetch_blob(&hash)?;
        match codec::decode_entry(&bytes).map_err(StoreError::from)? {
            Entry::Record(mut record) => {
                record.original = Some(hash);
                self.records.insert(recid.clone(), record);
                Ok(())
            }
            Entry::Link(_) => Err(StoreError::Corrupt(format!(
                "record {recid} resolves to link blob {hash}"
            ))
            .into()),
        }
    }

    pub(crate) fn live_record_mut(&mut self, recid: &RecId) -> Result<&mut Record, TxError> {
        self.load(recid)?;
        self.records
            .get_mut(recid)
            .filter(|r| !r.deleted)
            .ok_or_else(|| TxError::RecordNotFound(recid.clone()))
    }

    pub(crate) fn is_live(&mut self, recid: &RecId) -> Result<bool, TxError> {
        match self.live_record_mut(recid) {
            Ok(_) => Ok(true),
            Err(TxError::RecordNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn settable_attributes(
        &mut self,
        recid: &RecId,
        field: &str,
    ) -> Result<Arc<FieldAttributes>, TxError> {
        if is_reserved(field) {
            return Err(TxError::ReservedField(field.to_owned()));
        }
        let template = self.require_template()?;
        let rectype = self.live_record_mut(recid)?.rectype().to_owned();
        let attrs = template
            .field_attributes(&rectype, field)
            .ok_or_else(|| TxError::UnknownField {
                rectype: rectype.clone(),
                field: field.to_owned(),
            })?;
        if attrs.calculated.is_some() {
            return Err(TxError::CalculatedField {
                rectype,
                field: field.to_owned(),
            });
        }
        Ok(attrs)
    }

    /// Stores an already-validated encoded value and dirties calculated
    /// fields that read it. Returns whether the stored value changed.
    pub(crate) fn write_field(
        &mut self,
        recid: &RecId,
        field: &str,
        value: Option<String>,
    ) -> Result<bool, TxError> {
        let record = self.live_record_mut(recid)?;
        if !record.put(field, value) {
            return Ok(false);
        }
        let rectype = record.rectype().to_owned();
        self.mark_field_dependents(recid, &rectype, field)?;
        Ok(true)
    }

    fn mark_field_dependents(
        &mut self,
        recid: &RecId,
        rectype: &str,
        field: &str,
    ) -> Result<(), TxError> {
        let Some(template) = self.template.clone() else {
            return Ok(());
        };
        let readers: Vec<String> = self
            .dependencies
            .iter()
            .filter(|(_, dep)| dep.reads(field))
            .map(|(link, _)| link.clone())
            .collect();
        for link in readers {
            let on_from_side = template
                .linktype(&link)
                .is_some_and(|lt| lt.from.link_rectypes.contains(rectype));
            if !on_from_side {
                continue;
            }
            let targets: Vec<RecId> = self
                .current_links(&LinkFilter::outgoing(recid).named(link.as_str()))?
                .into_iter()
                .map(|l| l.to)
                .collect();
            if let Some(dep) = self.dependencies.get_mut(&link) {
                dep.dirty.extend(targets);
            }
        }
        Ok(())
    }

    /// Live links matching `filter` as this transaction sees them:
    /// baseline links, minus staged deletes, plus staged adds.
    pub(crate) fn current_links(&self, filter: &LinkFilter) -> Result<BTreeSet<LinkKey>, TxError> {
        let mut links: BTreeSet<LinkKey> = self
            .store
            .query_links(filter, self.baseline.as_ref())?
            .into_iter()
            .filter(|link| !self.links_delete.contains(link))
            .collect();
        links.extend(self.links_new.iter().filter(|l| filter.matches(l)).cloned());
        Ok(links)
    }

    /// Live records of `rectype` whose `field` holds `value`, with the
    /// transaction's own copies taking precedence over the baseline.
    pub(crate) fn value_holders(
        &self,
        rectype: &str,
        field: &str,
        value: &str,
    ) -> Result<BTreeSet<RecId>, TxError> {
        let predicate = Predicate::rectype(rectype).and(Predicate::field_eq(field, value));
        let mut holders: BTreeSet<RecId> = self
            .store
            .query(&predicate, self.baseline.as_ref())?
            .into_iter()
            .filter(|recid| !self.records.contains_key(recid))
            .collect();
        holders.extend(
            self.records
                .values()
                .filter(|r| !r.deleted && predicate.matches(r))
                .map(|r| r.recid().clone()),
        );
        Ok(holders)
    }

    /// Installs a record that exists elsewhere in the DAG (a merge adopting
    /// the other leaf's addition). Every field counts as dirty.
    pub(crate) fn adopt_record(&mut self, source: &Record) -> Result<(), TxError> {
        let recid = source.recid().clone();
        let mut record = Record::new(recid.clone(), source.rectype());
        record.replace_fields(source.fields().clone());
        let fields: Vec<String> = record.dirty_fields.iter().cloned().collect();
        self.records.insert(recid.clone(), record);
        for field in fields {
            self.mark_field_dependents(&recid, source.rectype(), &field)?;
        }
        Ok(())
    }

    /// Replaces every field of a live record, bypassing inline checks
    /// (commit-time checks still apply).
    pub(crate) fn overwrite_fields(
        &mut self,
        recid: &RecId,
        fields: BTreeMap<String, String>,
    ) -> Result<(), TxError> {
        let record = self.live_record_mut(recid)?;
        let before = record.dirty_fields.clone();
        record.replace_fields(fields);
        let changed: Vec<String> = record.dirty_fields.difference(&before).cloned().collect();
        let rectype = record.rectype().to_owned();
        for field in changed {
            self.mark_field_dependents(recid, &rectype, &field)?;
        }
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

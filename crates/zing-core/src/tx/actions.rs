// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Action engine: keeps calculated fields equal to their aggregates.
//!
//! Each link type that some calculated field depends on gets a
//! [`DependencyInfo`]. Changing a link, or a field that is read through a
//! link, dirties the *to* record; [`Transaction::perform_actions`] then
//! recomputes dirty targets until a pass leaves nothing dirty. Writing a
//! calculated field can dirty further targets, so chains settle over several
//! passes.
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use super::{Transaction, TxError};
use crate::ident::RecId;
use crate::index::LinkFilter;
use crate::store::Repository;
use crate::template::{Builtin, Template};

/// A calculated field fed by one link type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CalcTarget {
    pub(crate) rectype: String,
    pub(crate) field: String,
    pub(crate) builtin: Builtin,
    pub(crate) field_from: Option<String>,
}

/// Per-link-type bookkeeping.
#[derive(Clone, Debug, Default)]
pub(crate) struct DependencyInfo {
    /// Calculated fields on the *to* side of the link type.
    pub(crate) calcs: Vec<CalcTarget>,
    /// Cached *from* sets, keyed by *to* record.
    pub(crate) froms: BTreeMap<RecId, BTreeSet<RecId>>,
    /// *To* records awaiting recomputation.
    pub(crate) dirty: BTreeSet<RecId>,
}

impl DependencyInfo {
    /// Whether any calculation reads `field` from the *from* side.
    pub(crate) fn reads(&self, field: &str) -> bool {
        self.calcs
            .iter()
            .any(|c| c.field_from.as_deref() == Some(field))
    }
}

/// Groups a template's calculated fields by the link type they depend on.
pub(crate) fn dependencies_of(template: &Template) -> BTreeMap<String, DependencyInfo> {
    let mut out: BTreeMap<String, DependencyInfo> = BTreeMap::new();
    for (rectype, field, calc) in template.calculated_fields() {
        out.entry(calc.depends_on.clone())
            .or_default()
            .calcs
            .push(CalcTarget {
                rectype: rectype.to_owned(),
                field: field.to_owned(),
                builtin: calc.builtin,
                field_from: calc.field_from.clone(),
            });
    }
    out
}

/// Applies a reducer to the collected inputs. `None` clears the field.
pub(crate) fn reduce(builtin: Builtin, values: &[i64]) -> Option<i64> {
    match builtin {
        Builtin::Sum => Some(values.iter().fold(0_i64, |acc, v| acc.saturating_add(*v))),
        Builtin::Count => Some(i64::try_from(values.len()).unwrap_or(i64::MAX)),
        Builtin::Min => values.iter().min().copied(),
        Builtin::Max => values.iter().max().copied(),
        Builtin::Average => {
            let count = i128::try_from(values.len()).ok().filter(|n| *n > 0)?;
            let total: i128 = values.iter().map(|v| i128::from(*v)).sum();
            i64::try_from(total.div_euclid(count)).ok()
        }
    }
}

impl<S: Repository> Transaction<'_, S> {
    /// Recomputes every dirty calculated field until nothing changes.
    /// Returns the number of passes taken. Commit calls this before checking
    /// constraints.
    ///
    /// # Errors
    ///
    /// [`TxError::ActionsDidNotConverge`] when the pass limit is reached, or
    /// store failures while loading linked records.
    pub fn perform_actions(&mut self) -> Result<usize, TxError> {
        let limit = self.config().max_action_passes.max(1);
        let mut passes = 0;
        loop {
            let work: Vec<(String, BTreeSet<RecId>)> = self
                .dependencies
                .iter_mut()
                .filter(|(_, dep)| !dep.dirty.is_empty())
                .map(|(link, dep)| (link.clone(), std::mem::take(&mut dep.dirty)))
                .collect();
            if work.is_empty() {
                if passes > 0 {
                    debug!(passes, "calculated fields settled");
                }
                return Ok(passes);
            }
            if passes == limit {
                return Err(TxError::ActionsDidNotConverge(passes));
            }
            passes += 1;
            for (link, targets) in work {
                for to in targets {
                    self.recompute(&link, &to)?;
                }
            }
        }
    }

    /// Queues every calculated field of `recid` for recomputation.
    pub(crate) fn dirty_calculations(&mut self, recid: &RecId) -> Result<(), TxError> {
        let rectype = self.live_record_mut(recid)?.rectype().to_owned();
        for dep in self.dependencies.values_mut() {
            if dep.calcs.iter().any(|c| c.rectype == rectype) {
                dep.dirty.insert(recid.clone());
            }
        }
        Ok(())
    }

    fn recompute(&mut self, link: &str, to: &RecId) -> Result<(), TxError> {
        // A target that vanished from the baseline has nothing to hold.
        match self.load(to) {
            Ok(()) => {}
            Err(TxError::RecordNotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
        let Some(rectype) = self
            .records
            .get(to)
            .filter(|r| !r.deleted)
            .map(|r| r.rectype().to_owned())
        else {
            return Ok(());
        };
        let targets: Vec<CalcTarget> = self
            .dependencies
            .get(link)
            .map(|dep| {
                dep.calcs
                    .iter()
                    .filter(|c| c.rectype == rectype)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if targets.is_empty() {
            return Ok(());
        }
        let froms = self.froms(link, to)?;
        for target in targets {
            let values = match &target.field_from {
                Some(field) => self.collect_inputs(&froms, field)?,
                None => vec![0; froms.len()],
            };
            let result = reduce(target.builtin, &values).map(|n| n.to_string());
            trace!(%to, field = %target.field, value = ?result, "recomputed");
            self.write_field(to, &target.field, result)?;
        }
        Ok(())
    }

    fn froms(&mut self, link: &str, to: &RecId) -> Result<BTreeSet<RecId>, TxError> {
        if let Some(hit) = self.dependencies.get(link).and_then(|d| d.froms.get(to)) {
            return Ok(hit.clone());
        }
        let froms: BTreeSet<RecId> = self
            .current_links(&LinkFilter::incoming(to).named(link))?
            .into_iter()
            .map(|l| l.from)
            .collect();
        if let Some(dep) = self.dependencies.get_mut(link) {
            dep.froms.insert(to.clone(), froms.clone());
        }
        Ok(froms)
    }

    fn collect_inputs(&mut self, froms: &BTreeSet<RecId>, field: &str) -> Result<Vec<i64>, TxError> {
        let mut values = Vec::with_capacity(froms.len());
        for from in froms {
            self.load(from)?;
            let value = self
                .records
                .get(from)
                .filter(|r| !r.deleted)
                .and_then(|r| r.get(field))
                .and_then(|text| text.parse::<i64>().ok());
            values.extend(value);
        }
        Ok(values)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::memory::MemoryRepo;
    use crate::template::TemplateCache;
    use crate::value::Value;

    const TEMPLATE: &str = r#"{
        "rectypes": {
            "order": { "fields": {
                "total": { "datatype": "int", "calculated": { "builtin": "sum", "field_from": "qty", "depends_on": "has_items" } },
                "lines": { "datatype": "int", "calculated": { "builtin": "count", "depends_on": "has_items" } },
                "biggest": { "datatype": "int", "calculated": { "builtin": "max", "field_from": "qty", "depends_on": "has_items" } },
                "mean": { "datatype": "int", "calculated": { "builtin": "average", "field_from": "qty", "depends_on": "has_items" } }
            } },
            "item": { "fields": { "qty": { "datatype": "int" } } }
        },
        "directed_linktypes": {
            "has_items": { "from": { "link_rectypes": ["item"] }, "to": { "link_rectypes": ["order"] } }
        }
    }"#;

    #[test]
    fn reducers_handle_empty_input() {
        assert_eq!(reduce(Builtin::Sum, &[]), Some(0));
        assert_eq!(reduce(Builtin::Count, &[]), Some(0));
        assert_eq!(reduce(Builtin::Min, &[]), None);
        assert_eq!(reduce(Builtin::Max, &[]), None);
        assert_eq!(reduce(Builtin::Average, &[]), None);
    }

    #[test]
    fn average_is_floored() {
        assert_eq!(reduce(Builtin::Average, &[1, 2]), Some(1));
        assert_eq!(reduce(Builtin::Average, &[-1, -2]), Some(-2));
        assert_eq!(reduce(Builtin::Average, &[i64::MAX, i64::MAX]), Some(i64::MAX));
    }

    #[test]
    fn aggregates_follow_links_and_inputs() {
        let mut repo = MemoryRepo::new();
        let config = EngineConfig::default();
        let mut tx = Transaction::begin(
            &mut repo,
            &mut TemplateCache::new(1),
            &config,
            1,
            "alice",
            None,
        )
        .unwrap();
        tx.set_template(TEMPLATE.as_bytes()).unwrap();
        let order = tx.create_record("order").unwrap();
        assert_eq!(tx.value(&order, "total").unwrap(), Some(Value::Int(0)));

        let a = tx.create_record("item").unwrap();
        let b = tx.create_record("item").unwrap();
        tx.set_int(&a, "qty", 2).unwrap();
        tx.set_int(&b, "qty", 5).unwrap();
        tx.add_link(&a, &order, "has_items").unwrap();
        tx.add_link(&b, &order, "has_items").unwrap();
        tx.perform_actions().unwrap();
        assert_eq!(tx.value(&order, "total").unwrap(), Some(Value::Int(7)));
        assert_eq!(tx.value(&order, "lines").unwrap(), Some(Value::Int(2)));
        assert_eq!(tx.value(&order, "biggest").unwrap(), Some(Value::Int(5)));
        assert_eq!(tx.value(&order, "mean").unwrap(), Some(Value::Int(3)));

        tx.set_int(&b, "qty", 1).unwrap();
        tx.delete_link(&a, &order, "has_items").unwrap();
        tx.perform_actions().unwrap();
        assert_eq!(tx.value(&order, "total").unwrap(), Some(Value::Int(1)));
        assert_eq!(tx.value(&order, "lines").unwrap(), Some(Value::Int(1)));

        tx.delete_record(&b).unwrap();
        tx.perform_actions().unwrap();
        assert_eq!(tx.value(&order, "total").unwrap(), Some(Value::Int(0)));
        assert_eq!(tx.value(&order, "biggest").unwrap(), None);
        assert_eq!(tx.value(&order, "mean").unwrap(), None);
    }

    #[test]
    fn calculated_fields_are_not_settable() {
        let mut repo = MemoryRepo::new();
        let config = EngineConfig::default();
        let mut tx = Transaction::begin(
            &mut repo,
            &mut TemplateCache::new(1),
            &config,
            1,
            "alice",
            None,
        )
        .unwrap();
        tx.set_template(TEMPLATE.as_bytes()).unwrap();
        let order = tx.create_record("order").unwrap();
        assert!(matches!(
            tx.set_int(&order, "total", 3),
            Err(TxError::CalculatedField { .. })
        ));
    }

    #[test]
    fn aggregates_are_recomputed_at_commit_across_transactions() {
        let mut repo = MemoryRepo::new();
        let config = EngineConfig::default();
        let mut tx = Transaction::begin(
            &mut repo,
            &mut TemplateCache::new(1),
            &config,
            1,
            "alice",
            None,
        )
        .unwrap();
        tx.set_template(TEMPLATE.as_bytes()).unwrap();
        let order = tx.create_record("order").unwrap();
        let item = tx.create_record("item").unwrap();
        tx.set_int(&item, "qty", 4).unwrap();
        tx.add_link(&item, &order, "has_items").unwrap();
        let first = tx.commit(1).unwrap().id;

        let mut tx = Transaction::begin(
            &mut repo,
            &mut TemplateCache::new(1),
            &config,
            1,
            "bob",
            Some(first),
        )
        .unwrap();
        tx.set_int(&item, "qty", 9).unwrap();
        let second = tx.commit(2).unwrap().id;

        let mut tx = Transaction::begin(
            &mut repo,
            &mut TemplateCache::new(1),
            &config,
            1,
            "bob",
            Some(second),
        )
        .unwrap();
        assert_eq!(tx.value(&order, "total").unwrap(), Some(Value::Int(9)));
    }
}

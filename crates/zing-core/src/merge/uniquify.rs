// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Uniquify: repairs uniqueness violations a merge introduced.
//!
//! For each shared value one record keeps it and the others are altered by the
//! field's `uniqify` operator until their value is free. The keeper is chosen
//! from record history:
//!
//! * `last_modified`: the least recently modified record keeps its value.
//! * `last_created`: the earliest created record keeps its value.
//! * `least_impact`: the record with the most distinct editors keeps its value,
//!   then the one with the most versions; among the rest, records the merging
//!   user created most recently are altered first.
//!
//! Remaining ties go to the lowest recid.
use tracing::warn;

use super::{MergeAction, MergeError, MergeLogEntry};
use crate::constraint::{ConstraintViolations, Violation, ViolationKind};
use crate::ident::RecId;
use crate::index::HistoryEntry;
use crate::store::Repository;
use crate::template::{UniquifyOp, UniquifyPolicy, UniquifyWhich};
use crate::tx::{inc_digits_end, Transaction, TxError};

/// Ordering key; the smallest key keeps its value.
type KeepRank = (i64, i64, i64, RecId);

fn keep_rank(which: UniquifyWhich, recid: &RecId, history: &[HistoryEntry], who: &str) -> KeepRank {
    let newest = history.first().map_or(i64::MAX, |h| h.audit.when);
    let oldest = history.last();
    let created = oldest.map_or(i64::MAX, |h| h.audit.when);
    match which {
        UniquifyWhich::LastModified => (newest, 0, 0, recid.clone()),
        UniquifyWhich::LastCreated => (created, 0, 0, recid.clone()),
        UniquifyWhich::LeastImpact => {
            let mut editors: Vec<&str> = history.iter().map(|h| h.audit.who.as_str()).collect();
            editors.sort_unstable();
            editors.dedup();
            let editors = i64::try_from(editors.len()).unwrap_or(i64::MAX);
            let versions = i64::try_from(history.len()).unwrap_or(i64::MAX);
            let mine = oldest.filter(|h| h.audit.who == who).map_or(i64::MIN, |h| h.audit.when);
            (-editors, -versions, mine, recid.clone())
        }
    }
}

/// Attempts to repair every violation. Returns `Ok(false)` when some
/// violation is not a repairable uniqueness clash; nothing is changed then.
pub(crate) fn repair<S: Repository>(
    tx: &mut Transaction<'_, S>,
    violations: &ConstraintViolations,
    log: &mut Vec<MergeLogEntry>,
) -> Result<bool, MergeError> {
    let template = tx.require_template()?;
    let mut work = Vec::new();
    for violation in violations {
        let clash = match (violation.kind, &violation.field_name, &violation.field_value) {
            (ViolationKind::Unique, Some(field), Some(shared)) => template
                .field_attributes(&violation.rectype, field)
                .and_then(|attrs| attrs.uniquify.clone())
                .map(|policy| (field.as_str(), shared.as_str(), policy)),
            _ => None,
        };
        match clash {
            Some((field, shared, policy)) => work.push((violation, field, shared, policy)),
            None => return Ok(false),
        }
    }
    for (violation, field, shared, policy) in work {
        repair_one(tx, violation, field, shared, &policy, log)?;
    }
    Ok(true)
}

fn repair_one<S: Repository>(
    tx: &mut Transaction<'_, S>,
    violation: &Violation,
    field: &str,
    shared: &str,
    policy: &UniquifyPolicy,
    log: &mut Vec<MergeLogEntry>,
) -> Result<(), MergeError> {
    let mut ranked = Vec::with_capacity(violation.conflicting.len());
    for recid in &violation.conflicting {
        let history = tx.store().record_history(recid)?;
        ranked.push(keep_rank(policy.which, recid, &history, tx.who()));
    }
    ranked.sort();
    for (.., recid) in ranked.into_iter().skip(1) {
        let value = next_free(tx, &violation.rectype, field, shared, &policy.op)?;
        warn!(
            %recid,
            field = %field,
            from = %shared,
            to = %value,
            which = policy.which.name(),
            op = policy.op.name(),
            "uniquified"
        );
        tx.write_field(&recid, field, Some(value.clone()))?;
        log.push(MergeLogEntry {
            recid,
            field: Some(field.to_owned()),
            action: MergeAction::Uniquified(policy.op.clone()),
            value: Some(value),
        });
    }
    Ok(())
}

/// First value reachable from `start` by `op` that no live record holds.
fn next_free<S: Repository>(
    tx: &Transaction<'_, S>,
    rectype: &str,
    field: &str,
    start: &str,
    op: &UniquifyOp,
) -> Result<String, TxError> {
    let attempts = tx.config().generator_attempts.max(1);
    let exhausted = || TxError::GeneratorExhausted {
        rectype: rectype.to_owned(),
        field: field.to_owned(),
        attempts,
    };
    if let UniquifyOp::Generate(generator) = op {
        return tx.generate_unique(rectype, field, generator);
    }
    let mut candidate = start.to_owned();
    for _ in 0..attempts {
        candidate = match op {
            UniquifyOp::IncDigitsEnd => Some(inc_digits_end(&candidate)),
            UniquifyOp::Add { addend } => candidate
                .parse::<i64>()
                .ok()
                .and_then(|n| n.checked_add(*addend))
                .map(|n| n.to_string()),
            UniquifyOp::Generate(_) => None,
        }
        .ok_or_else(exhausted)?;
        if tx.value_holders(rectype, field, &candidate)?.is_empty() {
            return Ok(candidate);
        }
    }
    Err(exhausted())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ident::ChangesetId;
    use crate::memory::MemoryRepo;
    use crate::store::Audit;
    use crate::template::TemplateCache;
    use zing_cas::BlobHash;

    fn entry(who: &str, when: i64) -> HistoryEntry {
        HistoryEntry {
            hash: BlobHash([0; 32]),
            changeset: ChangesetId([0; 32]),
            generation: 1,
            audit: Audit::new(who, when),
        }
    }

    fn keeper(which: UniquifyWhich, candidates: &[(&str, Vec<HistoryEntry>)]) -> String {
        candidates
            .iter()
            .map(|(id, h)| keep_rank(which, &RecId::new(*id), h, "me"))
            .min()
            .map(|(.., r)| r.as_str().to_owned())
            .unwrap()
    }

    #[test]
    fn last_modified_keeps_the_oldest_edit() {
        let picks = [
            ("a", vec![entry("x", 30), entry("x", 5)]),
            ("b", vec![entry("x", 20), entry("x", 10)]),
        ];
        assert_eq!(keeper(UniquifyWhich::LastModified, &picks), "b");
        assert_eq!(keeper(UniquifyWhich::LastCreated, &picks), "a");
    }

    #[test]
    fn least_impact_protects_widely_edited_records() {
        let picks = [
            ("a", vec![entry("x", 30), entry("y", 5)]),
            ("b", vec![entry("x", 20), entry("x", 15), entry("x", 10)]),
        ];
        assert_eq!(keeper(UniquifyWhich::LeastImpact, &picks), "a");
        let mine = [
            ("a", vec![entry("me", 30)]),
            ("b", vec![entry("me", 10)]),
            ("c", vec![entry("x", 40)]),
        ];
        assert_eq!(keeper(UniquifyWhich::LeastImpact, &mine), "c");
    }

    #[test]
    fn ties_go_to_the_lowest_recid() {
        let picks = [("b", vec![entry("x", 1)]), ("a", vec![entry("x", 1)])];
        assert_eq!(keeper(UniquifyWhich::LastModified, &picks), "a");
    }

    #[test]
    fn unique_violations_without_a_value_are_not_repaired() {
        const TEMPLATE: &str = r#"{ "rectypes": { "user": { "fields": {
            "handle": { "datatype": "string", "constraints": { "unique": true },
                "merge": { "uniqify": { "which": "last_created", "op": "inc_digits_end" } } }
        } } } }"#;
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
        let id = tx.create_record("user").unwrap();
        let mut violation = Violation::field(ViolationKind::Unique, &id, "user", "handle", None);
        violation.conflicting.insert(id.clone());
        let violations = ConstraintViolations(vec![violation]);
        let mut log = Vec::new();
        assert!(!repair(&mut tx, &violations, &mut log).unwrap());
        assert!(log.is_empty());
        assert_eq!(tx.get_record(&id).unwrap().get("handle"), None);
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs, clippy::unwrap_used, clippy::panic)]
//! Three-way merges of diverged leaves.

use std::collections::BTreeMap;

use zing_core::codec::{encode_record, ChangesetDelta, DELTA_VERSION};
use zing_core::template::{AutoMerge, Generator, UniquifyOp};
use zing_core::{
    Audit, ChangesetId, CommitBatch, ContentStore, Database, MemoryRepo, MergeAction,
    MergeConflict, MergeError, MergeLogEntry, MergeOutcome, RecId, Record, Value, ViolationKind,
};
use zing_dry_tests::{
    commit, commit_on, DbTestBuilder, ACCOUNT_TEMPLATE, COUNTER_FLAG_TEMPLATE,
    COUNTER_NOTE_TEMPLATE, COUNTER_TEMPLATE, DOC_TEMPLATE, HANDLE_TEMPLATE, LEDGER_TEMPLATE,
    ORDER_TEMPLATE, STRICT_HANDLE_TEMPLATE, TEST_DAG, TICKET_TEMPLATE, TREE_TEMPLATE,
};

fn merger() -> Audit {
    Audit::new("merger", 100)
}

/// A counter at `count = 5`, `label = "start"`, committed on the seed.
fn counter_base() -> (Database<MemoryRepo>, ChangesetId, RecId) {
    let (mut db, seed) = DbTestBuilder::new().with_template(COUNTER_TEMPLATE).build();
    let mut counter = RecId::new("pending");
    let base = commit(&mut db, seed, "alice", 1, |tx| {
        counter = tx.create_record("counter")?;
        tx.set_int(&counter, "count", 5)?;
        tx.set_string(&counter, "label", "start")
    });
    (db, base, counter)
}

fn value_at(
    db: &mut Database<MemoryRepo>,
    state: ChangesetId,
    recid: &RecId,
    field: &str,
) -> Option<Value> {
    let mut tx = db.begin_tx(TEST_DAG, "reader", Some(state)).unwrap();
    tx.value(recid, field).unwrap()
}

fn conflicts_of(
    db: &mut Database<MemoryRepo>,
    a: ChangesetId,
    b: ChangesetId,
) -> Vec<MergeConflict> {
    let before = db.store().changeset_count();
    let Err(MergeError::Conflicts(conflicts)) = db.attempt_automatic_merge(TEST_DAG, a, b, &merger())
    else {
        panic!("merge was expected to conflict");
    };
    assert_eq!(db.store().changeset_count(), before);
    conflicts
}

fn repairs<'a>(outcome: &'a MergeOutcome, field: &str) -> Vec<&'a MergeLogEntry> {
    outcome
        .log
        .iter()
        .filter(|e| e.field.as_deref() == Some(field))
        .filter(|e| matches!(e.action, MergeAction::Uniquified(_)))
        .collect()
}

/// Writes a changeset on `baseline` that adds `record` as-is.
fn import(
    db: &mut Database<MemoryRepo>,
    baseline: ChangesetId,
    record: &Record,
    when: i64,
) -> ChangesetId {
    let bytes = encode_record(record);
    db.store_mut()
        .create_changeset(CommitBatch {
            dagnum: TEST_DAG,
            parents: vec![baseline],
            delta: ChangesetDelta {
                version: DELTA_VERSION,
                baseline: Some(baseline),
                template: None,
                add: vec![record.content_hash()],
                remove: Vec::new(),
            },
            blobs: vec![bytes],
            audit: Audit::new("importer", when),
        })
        .unwrap()
}

#[test]
fn concurrent_increments_merge_by_max() {
    let (mut db, base, counter) = counter_base();
    let a = commit(&mut db, base, "alice", 2, |tx| tx.set_int(&counter, "count", 6));
    let b = commit(&mut db, base, "bob", 3, |tx| tx.set_int(&counter, "count", 7));

    let outcome = db.attempt_automatic_merge(TEST_DAG, a, b, &merger()).unwrap();
    assert_eq!(outcome.ancestor, base);
    let entry = outcome
        .log
        .iter()
        .find(|e| e.field.as_deref() == Some("count"))
        .unwrap();
    assert_eq!(entry.action, MergeAction::AutoMerged(AutoMerge::Max));
    assert_eq!(entry.action.to_string(), "max");
    assert_eq!(entry.value.as_deref(), Some("7"));

    assert_eq!(db.leaf(TEST_DAG).unwrap(), Some(outcome.changeset));
    assert_eq!(
        value_at(&mut db, outcome.changeset, &counter, "count"),
        Some(Value::Int(7))
    );
    let merged = db.store().fetch_changeset(&outcome.changeset).unwrap();
    assert_eq!(merged.parents.len(), 2);
}

#[test]
fn divergent_edits_without_policy_name_the_field() {
    let (mut db, base, counter) = counter_base();
    let a = commit(&mut db, base, "alice", 2, |tx| tx.set_string(&counter, "label", "left"));
    let b = commit(&mut db, base, "bob", 3, |tx| tx.set_string(&counter, "label", "right"));
    let before = db.store().changeset_count();

    let Err(MergeError::Conflicts(conflicts)) = db.attempt_automatic_merge(TEST_DAG, a, b, &merger())
    else {
        panic!("conflicting labels merged");
    };
    assert_eq!(conflicts.len(), 1);
    let MergeConflict::Field { recid, field, ancestor, .. } = &conflicts[0] else {
        panic!("expected a field conflict, got {:?}", conflicts[0]);
    };
    assert_eq!(recid, &counter);
    assert_eq!(field, "label");
    assert_eq!(ancestor.as_deref(), Some("start"));
    assert!(conflicts[0].to_string().contains("label"));

    assert_eq!(db.store().changeset_count(), before);
    assert_eq!(db.leaves(TEST_DAG).len(), 2);
}

#[test]
fn merge_order_does_not_change_the_result() {
    let (mut db, base, counter) = counter_base();
    let a = commit(&mut db, base, "alice", 2, |tx| tx.set_string(&counter, "label", "renamed"));
    let b = commit(&mut db, base, "bob", 3, |tx| {
        let other = tx.create_record("counter")?;
        tx.set_int(&other, "count", 1)
    });

    let forward = db.attempt_automatic_merge(TEST_DAG, a, b, &merger()).unwrap();
    let count = db.store().changeset_count();
    let backward = db.attempt_automatic_merge(TEST_DAG, b, a, &merger()).unwrap();

    assert_eq!(forward.changeset, backward.changeset);
    assert_eq!(forward.leaves, backward.leaves);
    assert_eq!(forward.log, backward.log);
    assert_eq!(db.store().changeset_count(), count);
    assert_eq!(
        value_at(&mut db, forward.changeset, &counter, "label"),
        Some(Value::String("renamed".into()))
    );
}

#[test]
fn deleting_a_record_the_other_side_modified_conflicts() {
    let (mut db, base, counter) = counter_base();
    let a = commit(&mut db, base, "alice", 2, |tx| tx.delete_record(&counter));
    let b = commit(&mut db, base, "bob", 3, |tx| tx.set_int(&counter, "count", 9));

    let Err(MergeError::Conflicts(conflicts)) = db.attempt_automatic_merge(TEST_DAG, a, b, &merger())
    else {
        panic!("delete/modify merged");
    };
    assert!(conflicts
        .iter()
        .any(|c| matches!(c, MergeConflict::DeleteMod { recid } if recid == &counter)));
}

#[test]
fn shared_generated_handles_are_uniquified() {
    let (mut db, seed) = DbTestBuilder::new().with_template(HANDLE_TEMPLATE).build();
    let mut first = RecId::new("pending");
    let mut second = RecId::new("pending");
    let a = commit(&mut db, seed, "alice", 2, |tx| {
        first = tx.create_record("user")?;
        tx.set_string(&first, "handle", "amy7")
    });
    let b = commit(&mut db, seed, "bob", 3, |tx| {
        second = tx.create_record("user")?;
        tx.set_string(&second, "handle", "amy7")
    });

    let outcome = db.attempt_automatic_merge(TEST_DAG, a, b, &merger()).unwrap();
    let repaired: Vec<_> = outcome
        .log
        .iter()
        .filter(|e| matches!(e.action, MergeAction::Uniquified(UniquifyOp::IncDigitsEnd)))
        .collect();
    assert_eq!(repaired.len(), 1);
    assert_eq!(repaired[0].recid, second);
    assert_eq!(repaired[0].value.as_deref(), Some("amy8"));

    assert_eq!(
        value_at(&mut db, outcome.changeset, &first, "handle"),
        Some(Value::String("amy7".into()))
    );
    assert_eq!(
        value_at(&mut db, outcome.changeset, &second, "handle"),
        Some(Value::String("amy8".into()))
    );
}

#[test]
fn clashes_without_a_repair_policy_are_unresolvable() {
    let (mut db, seed) = DbTestBuilder::new().with_template(STRICT_HANDLE_TEMPLATE).build();
    let a = commit(&mut db, seed, "alice", 2, |tx| {
        let id = tx.create_record("user")?;
        tx.set_string(&id, "handle", "amy")
    });
    let b = commit(&mut db, seed, "bob", 3, |tx| {
        let id = tx.create_record("user")?;
        tx.set_string(&id, "handle", "amy")
    });
    let before = db.store().changeset_count();

    let Err(MergeError::Unresolvable(violations)) =
        db.attempt_automatic_merge(TEST_DAG, a, b, &merger())
    else {
        panic!("duplicate handles merged");
    };
    assert!(violations.has_kind(ViolationKind::Unique));
    assert_eq!(db.store().changeset_count(), before);
}

#[test]
fn unrelated_roots_have_no_ancestor() {
    let (mut db, seed) = DbTestBuilder::new().with_template(TREE_TEMPLATE).build();
    let other = commit_on(&mut db, TEST_DAG, None, "bob", 1, |tx| {
        tx.set_template(COUNTER_TEMPLATE.as_bytes())
    });
    assert!(matches!(
        db.attempt_automatic_merge(TEST_DAG, seed, other, &merger()),
        Err(MergeError::NoAncestorFound { .. })
    ));
}

#[test]
fn links_from_both_leaves_are_kept_and_totals_recalculated() {
    let (mut db, seed) = DbTestBuilder::new().with_template(ORDER_TEMPLATE).build();
    let mut order = RecId::new("pending");
    let base = commit(&mut db, seed, "alice", 1, |tx| {
        order = tx.create_record("order")?;
        let first = tx.create_record("item")?;
        tx.add_link(&order, &first, "has_items")
    });
    let a = commit(&mut db, base, "alice", 2, |tx| {
        let item = tx.create_record("item")?;
        tx.set_int(&item, "qty", 3)?;
        tx.add_link(&item, &order, "part_of")
    });
    let b = commit(&mut db, base, "bob", 3, |tx| {
        let item = tx.create_record("item")?;
        tx.set_int(&item, "qty", 4)?;
        tx.add_link(&item, &order, "part_of")
    });
    assert_eq!(value_at(&mut db, a, &order, "total"), Some(Value::Int(3)));

    let outcome = db.attempt_automatic_merge(TEST_DAG, a, b, &merger()).unwrap();
    assert!(outcome.log.iter().any(|e| e.recid == order
        && e.field.as_deref() == Some("total")
        && e.action == MergeAction::Recalculated));

    let mut tx = db.begin_tx(TEST_DAG, "reader", Some(outcome.changeset)).unwrap();
    assert_eq!(tx.links_to(&order, "part_of").unwrap().len(), 2);
    assert_eq!(tx.value(&order, "total").unwrap(), Some(Value::Int(7)));
}

#[test]
fn linking_to_a_record_the_other_leaf_deleted_conflicts() {
    let (mut db, seed) = DbTestBuilder::new().with_template(TREE_TEMPLATE).build();
    let mut parent = RecId::new("pending");
    let mut child = RecId::new("pending");
    let base = commit(&mut db, seed, "alice", 1, |tx| {
        parent = tx.create_record("node")?;
        child = tx.create_record("node")?;
        Ok(())
    });
    let a = commit(&mut db, base, "alice", 2, |tx| tx.delete_record(&child));
    let b = commit(&mut db, base, "bob", 3, |tx| tx.add_link(&parent, &child, "primary"));

    let conflicts = conflicts_of(&mut db, a, b);
    assert!(conflicts
        .iter()
        .any(|c| matches!(c, MergeConflict::DeleteMod { recid } if recid == &child)));
    assert_eq!(db.leaves(TEST_DAG).len(), 2);
}

#[test]
fn record_merge_type_rejects_any_divergent_edit() {
    let (mut db, seed) = DbTestBuilder::new().with_template(LEDGER_TEMPLATE).build();
    let mut entry = RecId::new("pending");
    let base = commit(&mut db, seed, "alice", 1, |tx| {
        entry = tx.create_record("entry")?;
        tx.set_int(&entry, "amount", 1)?;
        tx.set_string(&entry, "memo", "rent")
    });
    let a = commit(&mut db, base, "alice", 2, |tx| tx.set_int(&entry, "amount", 2));
    let b = commit(&mut db, base, "bob", 3, |tx| tx.set_string(&entry, "memo", "rent, march"));

    let conflicts = conflicts_of(&mut db, a, b);
    assert_eq!(conflicts.len(), 1);
    assert!(matches!(
        &conflicts[0],
        MergeConflict::Record { recid, rectype } if recid == &entry && rectype == "entry"
    ));
}

#[test]
fn a_template_replaced_on_one_leaf_is_adopted() {
    let (mut db, base, counter) = counter_base();
    let a = commit(&mut db, base, "alice", 2, |tx| {
        tx.set_template(COUNTER_NOTE_TEMPLATE.as_bytes())
    });
    let b = commit(&mut db, base, "bob", 3, |tx| tx.set_int(&counter, "count", 9));

    let outcome = db.attempt_automatic_merge(TEST_DAG, a, b, &merger()).unwrap();
    let replaced = db.template_at(Some(&a)).unwrap().unwrap();
    let merged = db.template_at(Some(&outcome.changeset)).unwrap().unwrap();
    assert_eq!(merged.hash(), replaced.hash());
    assert!(merged.field_attributes("counter", "note").is_some());
    assert_eq!(
        value_at(&mut db, outcome.changeset, &counter, "count"),
        Some(Value::Int(9))
    );
}

#[test]
fn templates_replaced_differently_conflict() {
    let (mut db, base, _) = counter_base();
    let a = commit(&mut db, base, "alice", 2, |tx| {
        tx.set_template(COUNTER_NOTE_TEMPLATE.as_bytes())
    });
    let b = commit(&mut db, base, "bob", 3, |tx| {
        tx.set_template(COUNTER_FLAG_TEMPLATE.as_bytes())
    });

    let conflicts = conflicts_of(&mut db, a, b);
    assert!(conflicts
        .iter()
        .any(|c| matches!(c, MergeConflict::Template { .. })));
}

#[test]
fn the_same_recid_added_twice_with_different_content_conflicts() {
    let (mut db, seed) = DbTestBuilder::new().with_template(COUNTER_TEMPLATE).build();
    let recid = RecId::new("imported-counter");
    let counter = |count: &str| {
        Record::from_parts(
            recid.clone(),
            "counter".to_owned(),
            BTreeMap::from([("count".to_owned(), count.to_owned())]),
        )
    };
    let a = import(&mut db, seed, &counter("1"), 1);
    let b = import(&mut db, seed, &counter("2"), 2);

    let conflicts = conflicts_of(&mut db, a, b);
    assert_eq!(conflicts, vec![MergeConflict::AddAdd { recid }]);
}

#[test]
fn numeric_clashes_are_repaired_on_the_least_edited_record() {
    let (mut db, seed) = DbTestBuilder::new().with_template(ACCOUNT_TEMPLATE).build();
    let mut shared = RecId::new("pending");
    let mut fresh = RecId::new("pending");
    let base = commit(&mut db, seed, "alice", 1, |tx| {
        shared = tx.create_record("acct")?;
        tx.set_int(&shared, "num", 1)
    });
    let a = commit(&mut db, base, "bob", 2, |tx| tx.set_int(&shared, "num", 5));
    let b = commit(&mut db, base, "carol", 3, |tx| {
        fresh = tx.create_record("acct")?;
        tx.set_int(&fresh, "num", 5)
    });

    let outcome = db.attempt_automatic_merge(TEST_DAG, a, b, &merger()).unwrap();
    let repaired = repairs(&outcome, "num");
    assert_eq!(repaired.len(), 1);
    assert_eq!(repaired[0].recid, fresh);
    assert_eq!(
        repaired[0].action,
        MergeAction::Uniquified(UniquifyOp::Add { addend: 10 })
    );
    assert_eq!(repaired[0].value.as_deref(), Some("15"));
    assert_eq!(
        value_at(&mut db, outcome.changeset, &shared, "num"),
        Some(Value::Int(5))
    );
    assert_eq!(
        value_at(&mut db, outcome.changeset, &fresh, "num"),
        Some(Value::Int(15))
    );
}

#[test]
fn the_most_recent_edit_gets_a_generated_value() {
    let (mut db, seed) = DbTestBuilder::new().with_template(TICKET_TEMPLATE).build();
    let mut older = RecId::new("pending");
    let mut newer = RecId::new("pending");
    let base = commit(&mut db, seed, "alice", 1, |tx| {
        older = tx.create_record("ticket")?;
        newer = tx.create_record("ticket")?;
        tx.set_string(&older, "code", "aaa")?;
        tx.set_string(&newer, "code", "bbb")
    });
    let a = commit(&mut db, base, "alice", 2, |tx| tx.set_string(&older, "code", "zzz"));
    let b = commit(&mut db, base, "bob", 3, |tx| tx.set_string(&newer, "code", "zzz"));

    let outcome = db.attempt_automatic_merge(TEST_DAG, a, b, &merger()).unwrap();
    let repaired = repairs(&outcome, "code");
    assert_eq!(repaired.len(), 1);
    assert_eq!(repaired[0].recid, newer);
    assert!(matches!(
        &repaired[0].action,
        MergeAction::Uniquified(UniquifyOp::Generate(Generator::RandomUnique { .. }))
    ));
    let Some(Value::String(code)) = value_at(&mut db, outcome.changeset, &newer, "code") else {
        panic!("code was cleared");
    };
    assert_eq!(code.len(), 8);
    assert!(code.chars().all(|c| ('a'..='f').contains(&c)));
    assert_eq!(repaired[0].value.as_deref(), Some(code.as_str()));
    assert_eq!(
        value_at(&mut db, outcome.changeset, &older, "code"),
        Some(Value::String("zzz".into()))
    );
}

#[test]
fn the_latest_created_record_gets_the_merging_users_prefix() {
    let (mut db, seed) = DbTestBuilder::new().with_template(TICKET_TEMPLATE).build();
    let mut first = RecId::new("pending");
    let mut second = RecId::new("pending");
    let a = commit(&mut db, seed, "alice", 2, |tx| {
        first = tx.create_record("ticket")?;
        tx.set_string(&first, "slug", "intro")
    });
    let b = commit(&mut db, seed, "bob", 3, |tx| {
        second = tx.create_record("ticket")?;
        tx.set_string(&second, "slug", "intro")
    });

    let outcome = db.attempt_automatic_merge(TEST_DAG, a, b, &merger()).unwrap();
    let repaired = repairs(&outcome, "slug");
    assert_eq!(repaired.len(), 1);
    assert_eq!(repaired[0].recid, second);
    assert_eq!(
        repaired[0].action,
        MergeAction::Uniquified(UniquifyOp::Generate(Generator::UserPrefixUnique {
            length: Some(4)
        }))
    );
    let slug = repaired[0].value.clone().unwrap();
    assert!(slug.starts_with("merger-"));
    assert_eq!(slug.len(), "merger-".len() + 4);
    assert_eq!(
        value_at(&mut db, outcome.changeset, &first, "slug"),
        Some(Value::String("intro".into()))
    );
}

#[test]
fn recency_policies_use_the_leaves_audit_times() {
    let (mut db, seed) = DbTestBuilder::new().with_template(DOC_TEMPLATE).build();
    let mut doc = RecId::new("pending");
    let base = commit(&mut db, seed, "alice", 1, |tx| {
        doc = tx.create_record("doc")?;
        tx.set_string(&doc, "title", "draft")?;
        tx.set_string(&doc, "summary", "tbd")
    });
    let early = commit(&mut db, base, "alice", 2, |tx| {
        tx.set_string(&doc, "title", "early title")?;
        tx.set_string(&doc, "summary", "early summary")
    });
    let late = commit(&mut db, base, "bob", 5, |tx| {
        tx.set_string(&doc, "title", "late title")?;
        tx.set_string(&doc, "summary", "late summary")
    });

    let outcome = db.attempt_automatic_merge(TEST_DAG, early, late, &merger()).unwrap();
    let decided = |field: &str| {
        outcome
            .log
            .iter()
            .find(|e| e.field.as_deref() == Some(field))
            .map(|e| (e.action.clone(), e.value.clone()))
            .unwrap()
    };
    assert_eq!(
        decided("title"),
        (MergeAction::AutoMerged(AutoMerge::MostRecent), Some("late title".into()))
    );
    assert_eq!(
        decided("summary"),
        (MergeAction::AutoMerged(AutoMerge::LeastRecent), Some("early summary".into()))
    );
    assert_eq!(
        value_at(&mut db, outcome.changeset, &doc, "title"),
        Some(Value::String("late title".into()))
    );
    assert_eq!(
        value_at(&mut db, outcome.changeset, &doc, "summary"),
        Some(Value::String("early summary".into()))
    );
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs, clippy::unwrap_used, clippy::panic)]
//! Commit-time behaviour: defaults, uniqueness, link cardinality, calculated
//! fields and no-op commits.

use zing_core::{ContentStore, RecId, TxError, TxState, Value, ViolationKind};
use zing_dry_tests::{
    commit, DbTestBuilder, HANDLE_TEMPLATE, ORDER_TEMPLATE, STRICT_HANDLE_TEMPLATE, TEST_DAG,
    TREE_TEMPLATE,
};

#[test]
fn create_record_populates_defaults_before_any_setter() {
    let (mut db, base) = DbTestBuilder::new().with_template(HANDLE_TEMPLATE).build();
    let mut tx = db.begin_tx(TEST_DAG, "alice", Some(base)).unwrap();
    let id = tx.create_record("user").unwrap();

    let Some(Value::String(handle)) = tx.value(&id, "handle").unwrap() else {
        panic!("handle was not generated");
    };
    assert_eq!(handle.chars().count(), 6);
    assert!(handle.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    assert!(matches!(tx.value(&id, "created").unwrap(), Some(Value::DateTime(_))));
    assert_eq!(
        tx.value(&id, "owner").unwrap(),
        Some(Value::UserId("alice".into()))
    );
    tx.commit(1).unwrap();
}

#[test]
fn unique_values_are_enforced_within_and_across_commits() {
    let (mut db, base) = DbTestBuilder::new().with_template(STRICT_HANDLE_TEMPLATE).build();

    let mut tx = db.begin_tx(TEST_DAG, "alice", Some(base)).unwrap();
    let a = tx.create_record("user").unwrap();
    let b = tx.create_record("user").unwrap();
    tx.set_string(&a, "handle", "amy").unwrap();
    tx.set_string(&b, "handle", "amy").unwrap();
    let Err(TxError::ConstraintViolations(found)) = tx.commit(1) else {
        panic!("duplicate handles committed");
    };
    let unique: Vec<_> = found.iter().filter(|v| v.kind == ViolationKind::Unique).collect();
    assert!(!unique.is_empty());
    assert_eq!(unique[0].conflicting.len(), 2);
    assert_eq!(unique[0].field_value.as_deref(), Some("amy"));

    let first = commit(&mut db, base, "alice", 2, |tx| {
        let id = tx.create_record("user")?;
        tx.set_string(&id, "handle", "amy")
    });
    let mut tx = db.begin_tx(TEST_DAG, "bob", Some(first)).unwrap();
    let id = tx.create_record("user").unwrap();
    tx.set_string(&id, "handle", "amy").unwrap();
    assert!(matches!(
        tx.commit(3),
        Err(TxError::ConstraintViolations(v)) if v.has_kind(ViolationKind::Unique)
    ));
    assert_eq!(db.leaf(TEST_DAG).unwrap(), Some(first));
}

#[test]
fn order_without_items_fails_with_required_link() {
    let (mut db, base) = DbTestBuilder::new().with_template(ORDER_TEMPLATE).build();
    let before = db.store().changeset_count();
    let mut tx = db.begin_tx(TEST_DAG, "alice", Some(base)).unwrap();
    let order = tx.create_record("order").unwrap();
    let Err(TxError::ConstraintViolations(found)) = tx.commit(1) else {
        panic!("order without items committed");
    };
    let missing = found
        .iter()
        .find(|v| v.kind == ViolationKind::RequiredLink)
        .unwrap();
    assert_eq!(missing.recid, order);
    assert_eq!(missing.field_name.as_deref(), Some("has_items"));
    assert_eq!(db.store().changeset_count(), before);
}

#[test]
fn calculated_totals_follow_linked_items() {
    let (mut db, base) = DbTestBuilder::new().with_template(ORDER_TEMPLATE).build();
    let mut order = RecId::new("pending");
    let mut first_item = RecId::new("pending");
    let placed = commit(&mut db, base, "alice", 1, |tx| {
        order = tx.create_record("order")?;
        first_item = tx.create_record("item")?;
        let second = tx.create_record("item")?;
        tx.set_int(&first_item, "qty", 3)?;
        tx.set_int(&second, "qty", 4)?;
        tx.add_link(&order, &first_item, "has_items")?;
        tx.add_link(&first_item, &order, "part_of")?;
        tx.add_link(&second, &order, "part_of")
    });

    let mut tx = db.begin_tx(TEST_DAG, "alice", Some(placed)).unwrap();
    assert_eq!(tx.value(&order, "total").unwrap(), Some(Value::Int(7)));
    tx.set_int(&first_item, "qty", 10).unwrap();
    let updated = tx.commit(2).unwrap().id;

    let mut tx = db.begin_tx(TEST_DAG, "alice", Some(updated)).unwrap();
    assert_eq!(tx.value(&order, "total").unwrap(), Some(Value::Int(14)));
}

#[test]
fn singular_sides_hold_at_most_one_link() {
    let (mut db, base) = DbTestBuilder::new().with_template(TREE_TEMPLATE).build();
    let mut tx = db.begin_tx(TEST_DAG, "alice", Some(base)).unwrap();
    let root = tx.create_record("node").unwrap();
    let a = tx.create_record("node").unwrap();
    let b = tx.create_record("node").unwrap();
    tx.set_singular_link(&root, &a, "primary").unwrap();
    tx.set_singular_link(&root, &b, "primary").unwrap();
    assert_eq!(tx.links_from(&root, "primary").unwrap(), vec![b.clone()]);
    let linked = tx.commit(1).unwrap().id;

    let mut tx = db.begin_tx(TEST_DAG, "alice", Some(linked)).unwrap();
    tx.add_link(&root, &a, "primary").unwrap();
    let Err(TxError::ConstraintViolations(found)) = tx.commit(2) else {
        panic!("second primary link committed");
    };
    assert!(found.has_kind(ViolationKind::SingularLink));
}

#[test]
fn committing_nothing_returns_the_baseline() {
    let (mut db, base) = DbTestBuilder::new().with_template(TREE_TEMPLATE).build();
    let before = db.store().changeset_count();
    let tx = db.begin_tx(TEST_DAG, "alice", Some(base)).unwrap();
    let committed = tx.commit(5).unwrap();
    assert_eq!(committed.id, base);
    assert!(!committed.created);
    assert_eq!(db.store().changeset_count(), before);
    assert_eq!(db.store().fetch_dag_leaves(TEST_DAG).len(), 1);
}

#[test]
fn aborted_transactions_reject_further_work() {
    let (mut db, base) = DbTestBuilder::new().with_template(TREE_TEMPLATE).build();
    let mut tx = db.begin_tx(TEST_DAG, "alice", Some(base)).unwrap();
    let id = tx.create_record("node").unwrap();
    tx.abort();
    assert_eq!(tx.state(), TxState::Aborted);
    assert!(matches!(
        tx.set_string(&id, "name", "late"),
        Err(TxError::NotOpen(TxState::Aborted))
    ));
    drop(tx);
    assert_eq!(db.leaf(TEST_DAG).unwrap(), Some(base));
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Zing core: a schema-validated, DAG-versioned record store.
//!
//! Records are typed field maps checked against a JSON [`Template`]; links are
//! `(from, linktype, to)` triples between records. Every commit produces an
//! immutable changeset in a per-DAG graph. Branches are made by committing on
//! older baselines and reconciled with a three-way merge that applies per-field
//! automerge policies and repairs uniqueness clashes.
//!
//! # Layers
//!
//! * [`template`]: parsing, validation and the template cache.
//! * [`store`] / [`index`]: the repository traits; [`MemoryRepo`] implements
//!   both in process.
//! * [`tx`]: staging transactions, calculated fields and the commit pipeline.
//! * [`merge`]: ancestor search, change collection and the merge itself.
//! * [`Database`]: a repository with its settings and template cache.
//!
//! ```
//! use zing_core::{Database, EngineConfig, MemoryRepo, Value};
//!
//! let mut db = Database::new(MemoryRepo::new(), EngineConfig::default());
//! let mut tx = db.begin_tx(1, "alice", None).unwrap();
//! tx.set_template(br#"{"rectypes":{"note":{"fields":{"text":{"datatype":"string"}}}}}"#)
//!     .unwrap();
//! let id = tx.create_record("note").unwrap();
//! tx.set_field(&id, "text", Value::String("hello".into())).unwrap();
//! let first = tx.commit(1).unwrap();
//! assert_eq!(db.leaf(1).unwrap(), Some(first.id));
//! ```
//!
//! # Determinism
//!
//! Maps and sets are ordered, leaves are merged in canonical order and
//! changeset ids are content hashes, so replaying the same operations yields
//! the same ids. Only the unique-value generators draw randomness.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self
)]

pub mod codec;
pub mod config;
pub mod constraint;
mod db;
pub mod ident;
pub mod index;
mod memory;
pub mod merge;
pub mod record;
pub mod store;
pub mod template;
pub mod tx;
pub mod value;

pub use config::{ConfigError, ConfigService, ConfigStore, EngineConfig};
pub use constraint::{ConstraintViolations, Violation, ViolationKind};
pub use db::Database;
pub use ident::{ChangesetId, DagNum, RecId};
pub use index::{HistoryEntry, LinkFilter, Predicate, RecordIndex};
pub use memory::MemoryRepo;
pub use merge::{attempt_automatic_merge, MergeAction, MergeConflict, MergeError, MergeLogEntry, MergeOutcome};
pub use record::{LinkKey, Record};
pub use store::{Audit, Changeset, CommitBatch, ContentStore, Repository, StoreError};
pub use template::{SchemaError, Template, TemplateCache};
pub use tx::{CommitAttempt, Committed, LinkError, Transaction, TxError, TxState};
pub use value::{DataType, Value, ValueError};
pub use zing_cas::BlobHash;

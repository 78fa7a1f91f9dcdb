// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for Zing crates.
//!
//! # Modules
//!
//! - [`config`] - In-memory config store fake for testing without filesystem
//! - [`repo`] - Database builder and commit helpers
//! - [`templates`] - Template documents used across suites
#![forbid(unsafe_code)]

pub mod config;
pub mod repo;
pub mod templates;

pub use config::InMemoryConfigStore;
pub use repo::{commit, commit_on, DbTestBuilder, TEST_DAG};
pub use templates::{
    ACCOUNT_TEMPLATE, COUNTER_FLAG_TEMPLATE, COUNTER_NOTE_TEMPLATE, COUNTER_TEMPLATE,
    DOC_TEMPLATE, HANDLE_TEMPLATE, LEDGER_TEMPLATE, ORDER_TEMPLATE, STRICT_HANDLE_TEMPLATE,
    TICKET_TEMPLATE, TREE_TEMPLATE,
};

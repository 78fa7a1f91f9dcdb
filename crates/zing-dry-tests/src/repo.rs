// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Database builders and commit helpers for tests.

use zing_core::{ChangesetId, DagNum, Database, EngineConfig, MemoryRepo, Transaction, TxError};

/// DAG used by the builders unless told otherwise.
pub const TEST_DAG: DagNum = 1;

/// Builder for an in-memory database seeded with a template.
///
/// # Example
///
/// ```
/// use zing_dry_tests::{DbTestBuilder, COUNTER_TEMPLATE};
///
/// let (db, base) = DbTestBuilder::new().with_template(COUNTER_TEMPLATE).build();
/// assert_eq!(db.leaf(zing_dry_tests::TEST_DAG).unwrap(), Some(base));
/// ```
pub struct DbTestBuilder {
    template: Option<String>,
    config: EngineConfig,
    dagnum: DagNum,
    who: String,
}

impl Default for DbTestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DbTestBuilder {
    /// Empty template, default settings, DAG [`TEST_DAG`], user `"seed"`.
    pub fn new() -> Self {
        Self {
            template: None,
            config: EngineConfig::default(),
            dagnum: TEST_DAG,
            who: "seed".to_owned(),
        }
    }

    /// Template committed by the seed changeset.
    pub fn with_template(mut self, raw: &str) -> Self {
        self.template = Some(raw.to_owned());
        self
    }

    /// Engine settings.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// DAG the seed changeset lands in.
    pub fn with_dag(mut self, dagnum: DagNum) -> Self {
        self.dagnum = dagnum;
        self
    }

    /// Builds the database and commits the seed changeset at time 0.
    ///
    /// # Panics
    ///
    /// If the template is rejected.
    pub fn build(self) -> (Database<MemoryRepo>, ChangesetId) {
        let mut db = Database::new(MemoryRepo::new(), self.config);
        let template = self.template.unwrap_or_else(|| r#"{"rectypes":{}}"#.to_owned());
        let seed = commit_on(&mut db, self.dagnum, None, &self.who, 0, |tx| {
            tx.set_template(template.as_bytes())
        });
        (db, seed)
    }
}

/// Opens a transaction on `baseline`, runs `edit`, and commits at `when`.
///
/// # Panics
///
/// If `edit` or the commit fails.
#[allow(clippy::expect_used)]
pub fn commit_on<F>(
    db: &mut Database<MemoryRepo>,
    dagnum: DagNum,
    baseline: Option<ChangesetId>,
    who: &str,
    when: i64,
    edit: F,
) -> ChangesetId
where
    F: FnOnce(&mut Transaction<'_, MemoryRepo>) -> Result<(), TxError>,
{
    let mut tx = db.begin_tx(dagnum, who, baseline).expect("begin transaction");
    edit(&mut tx).expect("stage changes");
    tx.commit(when).expect("commit").id
}

/// [`commit_on`] in [`TEST_DAG`].
pub fn commit<F>(
    db: &mut Database<MemoryRepo>,
    baseline: ChangesetId,
    who: &str,
    when: i64,
    edit: F,
) -> ChangesetId
where
    F: FnOnce(&mut Transaction<'_, MemoryRepo>) -> Result<(), TxError>,
{
    commit_on(db, TEST_DAG, Some(baseline), who, when, edit)
}

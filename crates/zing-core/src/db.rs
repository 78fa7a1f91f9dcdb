// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Database facade: a repository, its engine settings and a template cache.
use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;
use zing_cas::BlobHash;

use crate::config::{ConfigError, ConfigService, ConfigStore, EngineConfig};
use crate::ident::{ChangesetId, DagNum};
use crate::merge::{self, MergeError, MergeOutcome};
use crate::store::{Audit, ContentStore, Repository, StoreError};
use crate::template::{SchemaError, Template, TemplateCache};
use crate::tx::{Transaction, TxError};

/// Entry point owning a repository.
///
/// Transactions borrow the database mutably, so at most one is open at a
/// time; branches are made by opening transactions on different baselines.
pub struct Database<S> {
    store: S,
    cache: TemplateCache,
    config: EngineConfig,
}

impl<S: Repository> Database<S> {
    /// Wraps `store` with the given settings.
    pub fn new(store: S, config: EngineConfig) -> Self {
        Self {
            cache: TemplateCache::new(config.template_cache_capacity),
            store,
            config,
        }
    }

    /// Wraps `store` with settings loaded from `service`.
    ///
    /// # Errors
    ///
    /// Config store or JSON failures.
    pub fn open<C: ConfigStore>(store: S, service: &ConfigService<C>) -> Result<Self, ConfigError> {
        Ok(Self::new(store, EngineConfig::load(service)?))
    }

    /// The repository.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable access to the repository.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The template cache.
    pub fn templates(&self) -> &TemplateCache {
        &self.cache
    }

    /// Consumes the database and returns the repository.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Parses and validates a template, caching the result.
    ///
    /// # Errors
    ///
    /// The first [`SchemaError`] found.
    pub fn validate_template(&mut self, raw: &[u8]) -> Result<Arc<Template>, SchemaError> {
        let template = Arc::new(Template::parse(raw)?);
        self.cache.insert(Arc::clone(&template));
        Ok(template)
    }

    /// Template in effect at `state`.
    ///
    /// # Errors
    ///
    /// Store failures or a stored template that no longer validates.
    pub fn template_at(&mut self, state: Option<&ChangesetId>) -> Result<Option<Arc<Template>>, TxError> {
        template_at(&self.store, &mut self.cache, state)
    }

    /// Opens a transaction on `baseline` in `dagnum`.
    ///
    /// # Errors
    ///
    /// Unknown baseline, a baseline from another DAG, or template failures.
    pub fn begin_tx(
        &mut self,
        dagnum: DagNum,
        who: impl Into<String>,
        baseline: Option<ChangesetId>,
    ) -> Result<Transaction<'_, S>, TxError> {
        if let Some(id) = &baseline {
            let cs = self.store.fetch_changeset(id)?;
            if cs.dagnum != dagnum {
                return Err(StoreError::DagMismatch {
                    parent: *id,
                    expected: dagnum,
                    found: cs.dagnum,
                }
                .into());
            }
        }
        Transaction::begin(
            &mut self.store,
            &mut self.cache,
            &self.config,
            dagnum,
            who,
            baseline,
        )
    }

    /// Opens a transaction on the single leaf of `dagnum` (or on nothing for
    /// an empty DAG).
    ///
    /// # Errors
    ///
    /// [`TxError::NeedsMerge`] when the DAG has several leaves.
    pub fn begin_on_leaf(&mut self, dagnum: DagNum, who: impl Into<String>) -> Result<Transaction<'_, S>, TxError> {
        let leaf = self.leaf(dagnum)?;
        self.begin_tx(dagnum, who, leaf)
    }

    /// Current leaves of `dagnum`.
    pub fn leaves(&self, dagnum: DagNum) -> BTreeSet<ChangesetId> {
        self.store.fetch_dag_leaves(dagnum)
    }

    /// The single leaf of `dagnum`; `None` for an empty DAG.
    ///
    /// # Errors
    ///
    /// [`TxError::NeedsMerge`] when there are several.
    pub fn leaf(&self, dagnum: DagNum) -> Result<Option<ChangesetId>, TxError> {
        let leaves = self.leaves(dagnum);
        if leaves.len() > 1 {
            return Err(TxError::NeedsMerge {
                dagnum,
                leaves: leaves.into_iter().collect(),
            });
        }
        Ok(leaves.into_iter().next())
    }

    /// Merges two leaves of `dagnum`.
    ///
    /// # Errors
    ///
    /// See [`merge::attempt_automatic_merge`].
    pub fn attempt_automatic_merge(
        &mut self,
        dagnum: DagNum,
        a: ChangesetId,
        b: ChangesetId,
        audit: &Audit,
    ) -> Result<MergeOutcome, MergeError> {
        merge::attempt_automatic_merge(
            &mut self.store,
            &mut self.cache,
            &self.config,
            dagnum,
            a,
            b,
            audit,
        )
    }

    /// Merges the two lowest leaves of `dagnum` until a single leaf remains.
    ///
    /// # Errors
    ///
    /// The first failed merge; merges before it stay committed.
    pub fn merge_leaves(&mut self, dagnum: DagNum, audit: &Audit) -> Result<Vec<MergeOutcome>, MergeError> {
        let mut outcomes = Vec::new();
        loop {
            let leaves = self.leaves(dagnum);
            let mut lowest = leaves.iter().copied();
            let (Some(a), Some(b)) = (lowest.next(), lowest.next()) else {
                break;
            };
            outcomes.push(self.attempt_automatic_merge(dagnum, a, b, audit)?);
        }
        if !outcomes.is_empty() {
            info!(dagnum, merges = outcomes.len(), "dag collapsed to one leaf");
        }
        Ok(outcomes)
    }
}

pub(crate) fn template_at<S: Repository>(
    store: &S,
    cache: &mut TemplateCache,
    state: Option<&ChangesetId>,
) -> Result<Option<Arc<Template>>, TxError> {
    match store.template_hash(state)? {
        Some(hash) => template_by_hash(store, cache, &hash).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn template_by_hash<S: ContentStore>(
    store: &S,
    cache: &mut TemplateCache,
    hash: &BlobHash,
) -> Result<Arc<Template>, TxError> {
    cache.get_or_parse(hash, || store.fetch_blob(hash).map_err(TxError::from))
}

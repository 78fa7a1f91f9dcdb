// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Link operations of a transaction.
use thiserror::Error;

use super::{Transaction, TxError};
use crate::ident::RecId;
use crate::index::LinkFilter;
use crate::record::LinkKey;
use crate::store::Repository;
use crate::template::{LinkEnd, LinkType};

/// Link failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// Link type not in the template.
    #[error("[LINK_UNKNOWN_TYPE] unknown link type `{0}`")]
    UnknownLinkType(String),
    /// No such live link.
    #[error("[LINK_NOT_FOUND] {0}")]
    LinkNotFound(LinkKey),
    /// An endpoint's rectype is not allowed on that side.
    #[error("[LINK_INVALID_RECTYPE] `{rectype}` cannot be on the {end} side of `{link}`")]
    InvalidRectypeForLink {
        /// Link type.
        link: String,
        /// Offending side.
        end: LinkEnd,
        /// Rectype of the endpoint.
        rectype: String,
    },
    /// Records with incoming links cannot be deleted.
    #[error("[LINK_DELETE_TARGET] {recid} still has {count} incoming link(s)")]
    CannotDeleteRecordWithLinksToIt {
        /// Record being deleted.
        recid: RecId,
        /// Links still pointing at it.
        count: usize,
    },
    /// Neither side of the link type is singular.
    #[error("[LINK_NOT_SINGULAR] link type `{0}` has no singular side")]
    NotSingular(String),
}

impl<S: Repository> Transaction<'_, S> {
    /// Links `from` to `to` with link type `name`. Adding a link that already
    /// exists is a no-op. Cardinality is checked at commit.
    ///
    /// # Errors
    ///
    /// Unknown link type, missing endpoint, or an endpoint of the wrong
    /// rectype.
    pub fn add_link(&mut self, from: &RecId, to: &RecId, name: &str) -> Result<(), TxError> {
        self.ensure_open()?;
        let template = self.require_template()?;
        let lt = template
            .linktype(name)
            .ok_or_else(|| LinkError::UnknownLinkType(name.to_owned()))?;
        self.check_endpoint(lt, LinkEnd::From, from)?;
        self.check_endpoint(lt, LinkEnd::To, to)?;
        let key = LinkKey::new(from.clone(), to.clone(), name);
        if self.link_exists(&key)? {
            return Ok(());
        }
        self.stage_link(&key)
    }

    /// Removes a live link.
    ///
    /// # Errors
    ///
    /// [`LinkError::LinkNotFound`] if the link is not live.
    pub fn delete_link(&mut self, from: &RecId, to: &RecId, name: &str) -> Result<(), TxError> {
        self.ensure_open()?;
        let key = LinkKey::new(from.clone(), to.clone(), name);
        if !self.link_exists(&key)? {
            return Err(LinkError::LinkNotFound(key).into());
        }
        self.unstage_link(&key)
    }

    /// Links `from` to `to`, first removing whatever occupies a singular side:
    /// other links leaving `from` when the *from* side is singular, other
    /// links reaching `to` when the *to* side is.
    ///
    /// # Errors
    ///
    /// As [`add_link`](Self::add_link), plus [`LinkError::NotSingular`].
    pub fn set_singular_link(&mut self, from: &RecId, to: &RecId, name: &str) -> Result<(), TxError> {
        self.ensure_open()?;
        let template = self.require_template()?;
        let lt = template
            .linktype(name)
            .ok_or_else(|| LinkError::UnknownLinkType(name.to_owned()))?;
        if !lt.from.singular && !lt.to.singular {
            return Err(LinkError::NotSingular(name.to_owned()).into());
        }
        self.check_endpoint(lt, LinkEnd::From, from)?;
        self.check_endpoint(lt, LinkEnd::To, to)?;
        let key = LinkKey::new(from.clone(), to.clone(), name);
        let mut displaced = std::collections::BTreeSet::new();
        if lt.from.singular {
            displaced.extend(self.current_links(&LinkFilter::outgoing(from).named(name))?);
        }
        if lt.to.singular {
            displaced.extend(self.current_links(&LinkFilter::incoming(to).named(name))?);
        }
        displaced.remove(&key);
        for link in &displaced {
            self.unstage_link(link)?;
        }
        if !self.link_exists(&key)? {
            self.stage_link(&key)?;
        }
        Ok(())
    }

    /// Targets of `name` links leaving `recid`.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn links_from(&self, recid: &RecId, name: &str) -> Result<Vec<RecId>, TxError> {
        Ok(self
            .current_links(&LinkFilter::outgoing(recid).named(name))?
            .into_iter()
            .map(|l| l.to)
            .collect())
    }

    /// Sources of `name` links reaching `recid`.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn links_to(&self, recid: &RecId, name: &str) -> Result<Vec<RecId>, TxError> {
        Ok(self
            .current_links(&LinkFilter::incoming(recid).named(name))?
            .into_iter()
            .map(|l| l.from)
            .collect())
    }

    /// Whether the link is live as this transaction sees it.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn link_exists(&self, key: &LinkKey) -> Result<bool, TxError> {
        if self.links_new.contains(key) {
            return Ok(true);
        }
        if self.links_delete.contains(key) {
            return Ok(false);
        }
        Ok(self
            .store
            .resolve_link_hash(key, self.baseline.as_ref())?
            .is_some())
    }

    fn check_endpoint(&mut self, lt: &LinkType, end: LinkEnd, recid: &RecId) -> Result<(), TxError> {
        let rectype = self.live_record_mut(recid)?.rectype().to_owned();
        if lt.side(end).link_rectypes.contains(&rectype) {
            Ok(())
        } else {
            Err(LinkError::InvalidRectypeForLink {
                link: lt.name.clone(),
                end,
                rectype,
            }
            .into())
        }
    }

    /// Stages a link as live, undoing a staged delete if there is one.
    pub(crate) fn stage_link(&mut self, key: &LinkKey) -> Result<(), TxError> {
        if !self.links_delete.remove(key) {
            self.links_new.insert(key.clone());
        }
        self.touch_link(key)
    }

    /// Stages a link as gone, undoing a staged add if there is one.
    pub(crate) fn unstage_link(&mut self, key: &LinkKey) -> Result<(), TxError> {
        if !self.links_new.remove(key) {
            self.links_delete.insert(key.clone());
        }
        self.touch_link(key)
    }

    fn touch_link(&mut self, key: &LinkKey) -> Result<(), TxError> {
        for recid in [&key.from, &key.to] {
            self.load(recid)?;
            if let Some(record) = self.records.get_mut(recid) {
                record.dirty_links = true;
            }
        }
        if let Some(dep) = self.dependencies.get_mut(&key.name) {
            dep.froms.remove(&key.to);
            dep.dirty.insert(key.to.clone());
        }
        Ok(())
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content-addressed blob storage for Zing.
//!
//! Every record version, link and template a changeset refers to is stored as
//! an opaque blob keyed by the BLAKE3 hash of its bytes ([`BlobHash`]). The
//! hash is content-only with no domain prefix, so a record edited back to an
//! earlier state lands on the earlier blob again. The merge engine's net
//! diff relies on that to cancel an add against a later remove.
//!
//! [`BlobStore`] is the storage seam; [`MemoryTier`] keeps blobs in process
//! and is what the reference repository builds on. A repository pins what its
//! changesets reference and may sweep the rest.
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

mod memory;
pub use memory::MemoryTier;

use std::fmt;
use std::sync::Arc;

/// BLAKE3 digest naming a stored blob.
///
/// Displays as 64 lowercase hex digits; [`short`](BlobHash::short) gives the
/// 8-digit prefix used in log lines.
#[repr(transparent)]
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, serde::Serialize, serde::Deserialize,
)]
pub struct BlobHash(pub [u8; 32]);

impl BlobHash {
    /// First four bytes in hex.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for BlobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Hash of `bytes` as stored by any [`BlobStore`].
pub fn blob_hash(bytes: &[u8]) -> BlobHash {
    BlobHash(*blake3::hash(bytes).as_bytes())
}

/// Blob storage failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CasError {
    /// A commit declared a hash its bytes do not produce.
    #[error("[CAS_HASH_MISMATCH] declared {declared}, bytes hash to {actual}")]
    HashMismatch {
        /// Hash named by the caller.
        declared: BlobHash,
        /// Hash of the bytes supplied.
        actual: BlobHash,
    },
}

/// Content-addressed blob storage.
///
/// Lookups of unknown hashes return `None`; the repository decides whether
/// that is an error.
pub trait BlobStore {
    /// Stores `bytes` and returns their hash. Storing the same bytes twice is
    /// a no-op.
    fn put(&mut self, bytes: &[u8]) -> BlobHash;

    /// Stores `bytes` a commit has already named by `declared`.
    ///
    /// # Errors
    ///
    /// [`CasError::HashMismatch`] when the bytes hash elsewhere; nothing is
    /// stored then.
    fn put_verified(&mut self, declared: BlobHash, bytes: &[u8]) -> Result<(), CasError>;

    /// Bytes stored under `hash`.
    fn get(&self, hash: &BlobHash) -> Option<Arc<[u8]>>;

    /// `true` when `hash` is stored.
    fn has(&self, hash: &BlobHash) -> bool;

    /// Keeps `hash` across sweeps. Pinning a hash before its bytes arrive is
    /// allowed.
    fn pin(&mut self, hash: &BlobHash);
}

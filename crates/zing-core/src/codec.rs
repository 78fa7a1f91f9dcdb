// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Canonical CBOR encoding for records, links and changeset deltas.
//!
//! Records and links are both stored as a CBOR array of `[name, value]` text
//! pairs, sorted by name with no duplicates. A record carries `recid` and
//! `rectype` members; a link carries exactly `from`, `link` and `to`. The pair
//! encoding is written by hand with shortest-form lengths so that the same
//! content always produces the same bytes (and therefore the same hash).
//!
//! Decoding goes through `ciborium` and then re-encodes: any input whose
//! re-encoding differs from the input bytes is rejected as non-canonical.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zing_cas::BlobHash;

use crate::ident::{ChangesetId, RecId};
use crate::record::{LinkKey, Record, FIELD_RECID, FIELD_RECTYPE};

/// Delta format version written by this crate.
pub const DELTA_VERSION: u32 = 1;

const LINK_FROM: &str = "from";
const LINK_NAME: &str = "link";
const LINK_TO: &str = "to";

/// A decoded blob referenced from a changeset delta.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entry {
    /// A record blob.
    Record(Record),
    /// A link blob.
    Link(LinkKey),
}

/// Persisted delta of one changeset relative to its baseline.
///
/// `add` and `remove` list blob hashes of records and links. `template` is
/// set only when the changeset replaced the template.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetDelta {
    /// Format version ([`DELTA_VERSION`]).
    pub version: u32,
    /// First parent, or `None` for a DAG root.
    pub baseline: Option<ChangesetId>,
    /// Replacement template blob.
    pub template: Option<BlobHash>,
    /// Blobs that become live.
    pub add: Vec<BlobHash>,
    /// Blobs that stop being live.
    pub remove: Vec<BlobHash>,
}

impl ChangesetDelta {
    /// `true` if the delta neither adds, removes, nor replaces anything.
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.template.is_none()
    }
}

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// CBOR serialization failed.
    #[error("encode error: {0}")]
    Encode(String),
    /// Bytes are not valid CBOR of the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
    /// Valid CBOR, but not the canonical encoding of its content.
    #[error("entry is not canonically encoded")]
    NonCanonical,
    /// A required member is absent.
    #[error("entry is missing member `{0}`")]
    MissingMember(&'static str),
    /// The entry is neither a record nor a link.
    #[error("entry is neither a record nor a link")]
    Unrecognized,
}

/// Canonical bytes of a record.
pub fn encode_record(record: &Record) -> Vec<u8> {
    let mut pairs: BTreeMap<&str, &str> = record
        .fields()
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    pairs.insert(FIELD_RECID, record.recid().as_str());
    pairs.insert(FIELD_RECTYPE, record.rectype());
    encode_pairs(pairs.into_iter())
}

/// Canonical bytes of a link.
pub fn encode_link(link: &LinkKey) -> Vec<u8> {
    // Already in name order.
    encode_pairs(
        [
            (LINK_FROM, link.from.as_str()),
            (LINK_NAME, link.name.as_str()),
            (LINK_TO, link.to.as_str()),
        ]
        .into_iter(),
    )
}

/// Decodes a record or link blob.
///
/// # Errors
///
/// Fails if the bytes are not a canonical pair array or if required members
/// are missing.
pub fn decode_entry(bytes: &[u8]) -> Result<Entry, CodecError> {
    let pairs: Vec<(String, String)> =
        ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
    let reencoded = encode_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    let sorted = pairs.windows(2).all(|w| w[0].0 < w[1].0);
    if !sorted || reencoded != bytes {
        return Err(CodecError::NonCanonical);
    }
    let mut members: BTreeMap<String, String> = pairs.into_iter().collect();

    if let Some(recid) = members.remove(FIELD_RECID) {
        let rectype = members
            .remove(FIELD_RECTYPE)
            .ok_or(CodecError::MissingMember(FIELD_RECTYPE))?;
        return Ok(Entry::Record(Record::from_parts(
            RecId::new(recid),
            rectype,
            members,
        )));
    }
    if members.contains_key(LINK_NAME) {
        if members.len() != 3 {
            return Err(CodecError::Unrecognized);
        }
        let mut take = |key: &'static str| members.remove(key).ok_or(CodecError::MissingMember(key));
        let from = take(LINK_FROM)?;
        let name = take(LINK_NAME)?;
        let to = take(LINK_TO)?;
        return Ok(Entry::Link(LinkKey::new(RecId::new(from), RecId::new(to), name)));
    }
    Err(CodecError::Unrecognized)
}

/// Encodes a changeset delta.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode_delta(delta: &ChangesetDelta) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(delta, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes a changeset delta.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] on malformed input.
pub fn decode_delta(bytes: &[u8]) -> Result<ChangesetDelta, CodecError> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

fn encode_pairs<'a>(pairs: impl ExactSizeIterator<Item = (&'a str, &'a str)>) -> Vec<u8> {
    let mut out = Vec::new();
    write_major(4, pairs.len() as u64, &mut out);
    for (name, value) in pairs {
        write_major(4, 2, &mut out);
        write_text(name, &mut out);
        write_text(value, &mut out);
    }
    out
}

fn write_text(text: &str, out: &mut Vec<u8>) {
    write_major(3, text.len() as u64, out);
    out.extend_from_slice(text.as_bytes());
}

#[allow(clippy::cast_possible_truncation)]
fn write_major(major: u8, n: u64, out: &mut Vec<u8>) {
    let head = major << 5;
    if n < 24 {
        out.push(head | n as u8);
    } else if n <= u64::from(u8::MAX) {
        out.push(head | 24);
        out.push(n as u8);
    } else if n <= u64::from(u16::MAX) {
        out.push(head | 25);
        out.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= u64::from(u32::MAX) {
        out.push(head | 26);
        out.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        out.push(head | 27);
        out.extend_from_slice(&n.to_be_bytes());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(fields: &[(&str, &str)]) -> Record {
        Record::from_parts(
            RecId::new("0123"),
            "item".into(),
            fields
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        )
    }

    #[test]
    fn ciborium_agrees_with_hand_encoding() {
        let rec = record(&[("name", "widget"), ("qty", "12")]);
        let mut via_serde = Vec::new();
        let pairs: Vec<(&str, &str)> = vec![
            ("name", "widget"),
            ("qty", "12"),
            ("recid", "0123"),
            ("rectype", "item"),
        ];
        ciborium::into_writer(&pairs, &mut via_serde).unwrap();
        assert_eq!(encode_record(&rec), via_serde);
    }

    #[test]
    fn link_round_trip() {
        let link = LinkKey::new(RecId::new("a"), RecId::new("b"), "has_items");
        let decoded = decode_entry(&encode_link(&link)).unwrap();
        assert_eq!(decoded, Entry::Link(link));
    }

    #[test]
    fn unsorted_pairs_are_rejected() {
        let pairs: Vec<(&str, &str)> = vec![("rectype", "item"), ("recid", "x")];
        let mut bytes = Vec::new();
        ciborium::into_writer(&pairs, &mut bytes).unwrap();
        assert_eq!(decode_entry(&bytes), Err(CodecError::NonCanonical));
    }

    #[test]
    fn record_without_rectype_is_rejected() {
        let pairs: Vec<(&str, &str)> = vec![("qty", "1"), ("recid", "x")];
        let mut bytes = Vec::new();
        ciborium::into_writer(&pairs, &mut bytes).unwrap();
        assert_eq!(
            decode_entry(&bytes),
            Err(CodecError::MissingMember(FIELD_RECTYPE))
        );
    }

    #[test]
    fn delta_round_trip() {
        let delta = ChangesetDelta {
            version: DELTA_VERSION,
            baseline: Some(ChangesetId([7; 32])),
            template: None,
            add: vec![BlobHash([1; 32])],
            remove: vec![],
        };
        assert_eq!(decode_delta(&encode_delta(&delta).unwrap()).unwrap(), delta);
    }

    proptest! {
        #[test]
        fn record_encoding_is_stable(
            fields in proptest::collection::btree_map("[a-z_]{1,8}", ".{0,40}", 0..8)
        ) {
            let fields: BTreeMap<String, String> = fields
                .into_iter()
                .filter(|(k, _)| k != FIELD_RECID && k != FIELD_RECTYPE)
                .collect();
            let rec = Record::from_parts(RecId::generate(), "item".into(), fields);
            let bytes = encode_record(&rec);
            let Entry::Record(back) = decode_entry(&bytes).unwrap() else {
                panic!("decoded a link");
            };
            prop_assert_eq!(encode_record(&back), bytes);
            prop_assert_eq!(back.fields(), rec.fields());
        }
    }
}

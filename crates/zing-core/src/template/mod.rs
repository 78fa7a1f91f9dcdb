// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Templates: the declarative schema every record and link is checked against.
//!
//! A [`Template`] is parsed and fully validated from a JSON document by
//! [`Template::parse`]; once built it is immutable and shared behind `Arc`.
//! Per-field constraint bundles ([`FieldAttributes`]) are resolved lazily and
//! memoized inside the template.
mod attrs;
mod cache;
mod validate;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use zing_cas::{blob_hash, BlobHash};

use crate::value::{DataType, Value};

pub use attrs::FieldAttributes;
pub use cache::TemplateCache;
pub use validate::{SchemaError, SchemaErrorKind};

/// A validated template.
#[derive(Debug)]
pub struct Template {
    rectypes: BTreeMap<String, Rectype>,
    linktypes: BTreeMap<String, LinkType>,
    canonical: Vec<u8>,
    hash: BlobHash,
    attributes: RwLock<HashMap<String, Arc<FieldAttributes>>>,
}

/// A record type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rectype {
    /// Rectype name.
    pub name: String,
    /// Declared fields.
    pub fields: BTreeMap<String, FieldSpec>,
    /// Records of this type cannot be deleted.
    pub no_recid: bool,
    /// Merge granularity.
    pub merge_type: MergeType,
}

/// How concurrent modifications of one record are merged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergeType {
    /// Field by field.
    #[default]
    Field,
    /// The record is one unit; differing edits conflict.
    Record,
}

/// Declaration of one field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    /// Value type.
    pub datatype: DataType,
    /// Value constraints.
    pub constraints: Constraints,
    /// Aggregate over linked records, if this field is calculated.
    pub calculated: Option<Calculated>,
    /// Merge policies.
    pub merge: MergeSpec,
}

/// Constraint block of a field. Allowed and prohibited values are kept in
/// canonical encoded form.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Constraints {
    /// Field must be set at commit.
    pub required: bool,
    /// Numeric lower bound.
    pub min: Option<i64>,
    /// Numeric upper bound.
    pub max: Option<i64>,
    /// Minimum length in characters.
    pub min_length: Option<usize>,
    /// Maximum length in characters.
    pub max_length: Option<usize>,
    /// Whitelist.
    pub allowed: Option<Vec<String>>,
    /// Blacklist.
    pub prohibited: Option<Vec<String>>,
    /// At most one live record may hold each value.
    pub unique: bool,
    /// Value applied by `create_record`.
    pub default: Option<DefaultSpec>,
}

/// Source of a field's initial value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DefaultSpec {
    /// A fixed value.
    Literal(Value),
    /// Creation time (`datetime` fields, `"now"`).
    Now,
    /// Creating user (`userid` fields, `"whoami"`).
    WhoAmI,
    /// A generated value unique within the branch.
    Generate(Generator),
}

/// Unique string generators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Generator {
    /// `gen_random_unique`: random characters from `alphabet`.
    RandomUnique {
        /// Characters to draw; engine default when absent.
        length: Option<usize>,
        /// Alphabet; lowercase alphanumerics when absent.
        alphabet: Option<String>,
    },
    /// `gen_userprefix_unique`: `<who>-<random>`.
    UserPrefixUnique {
        /// Length of the random suffix.
        length: Option<usize>,
    },
}

impl Generator {
    /// Template spelling.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RandomUnique { .. } => "gen_random_unique",
            Self::UserPrefixUnique { .. } => "gen_userprefix_unique",
        }
    }
}

/// A calculated (aggregate) field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Calculated {
    /// Reducer.
    pub builtin: Builtin,
    /// Field read on each *from* record; absent for `count`.
    pub field_from: Option<String>,
    /// Link type whose *to* side is this field's rectype.
    pub depends_on: String,
}

/// Aggregate reducers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    /// Sum of values.
    Sum,
    /// Number of linked records.
    Count,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
    /// Floored integer mean.
    Average,
}

impl Builtin {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "sum" => Self::Sum,
            "count" => Self::Count,
            "min" => Self::Min,
            "max" => Self::Max,
            "average" => Self::Average,
            _ => return None,
        })
    }
}

/// Merge policies of a field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeSpec {
    /// Ordered automerge policies, tried until one decides.
    pub auto: Vec<AutoMerge>,
    /// Repair applied when a merge produces a uniqueness violation.
    pub uniqify: Option<UniquifyPolicy>,
}

/// Automatic resolution of a field modified on both sides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoMerge {
    /// Value from the leaf with the newest audit time.
    MostRecent,
    /// Value from the leaf with the oldest audit time.
    LeastRecent,
    /// Longer text.
    Longest,
    /// Shorter text.
    Shortest,
    /// Larger number.
    Max,
    /// Smaller number.
    Min,
    /// Ancestor plus both deltas.
    Sum,
    /// Floored mean of both sides.
    Average,
}

impl AutoMerge {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "most_recent" => Self::MostRecent,
            "least_recent" => Self::LeastRecent,
            "longest" => Self::Longest,
            "shortest" => Self::Shortest,
            "max" => Self::Max,
            "min" => Self::Min,
            "sum" => Self::Sum,
            "average" => Self::Average,
            _ => return None,
        })
    }

    /// Template spelling.
    pub fn name(self) -> &'static str {
        match self {
            Self::MostRecent => "most_recent",
            Self::LeastRecent => "least_recent",
            Self::Longest => "longest",
            Self::Shortest => "shortest",
            Self::Max => "max",
            Self::Min => "min",
            Self::Sum => "sum",
            Self::Average => "average",
        }
    }

    /// Whether the policy can decide values of `datatype`.
    pub fn applies_to(self, datatype: DataType) -> bool {
        match self {
            Self::MostRecent | Self::LeastRecent => true,
            Self::Longest | Self::Shortest => datatype.is_textual(),
            Self::Max | Self::Min => datatype.is_ordered_number(),
            Self::Sum | Self::Average => datatype == DataType::Int,
        }
    }
}

/// Uniquify repair: which record gets altered and how.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniquifyPolicy {
    /// Selection rule.
    pub which: UniquifyWhich,
    /// Alteration.
    pub op: UniquifyOp,
}

/// Which of the records sharing a value is altered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UniquifyWhich {
    /// The most recently modified records are altered.
    LastModified,
    /// The most recently created records are altered.
    LastCreated,
    /// The records whose change disturbs the fewest users are altered.
    LeastImpact,
}

impl UniquifyWhich {
    /// Template spelling.
    pub fn name(self) -> &'static str {
        match self {
            Self::LastModified => "last_modified",
            Self::LastCreated => "last_created",
            Self::LeastImpact => "least_impact",
        }
    }
}

/// How a conflicting value is altered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UniquifyOp {
    /// Add `addend` (int fields) until free.
    Add {
        /// Step added on each attempt.
        addend: i64,
    },
    /// Increment the trailing digits (string fields) until free.
    IncDigitsEnd,
    /// Replace with a fresh generated value.
    Generate(Generator),
}

impl UniquifyOp {
    /// Template spelling.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::IncDigitsEnd => "inc_digits_end",
            Self::Generate(g) => g.name(),
        }
    }
}

/// A directed link type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkType {
    /// Link name.
    pub name: String,
    /// Source side.
    pub from: LinkSide,
    /// Target side.
    pub to: LinkSide,
}

impl LinkType {
    /// Side declaration for `end`.
    pub fn side(&self, end: LinkEnd) -> &LinkSide {
        match end {
            LinkEnd::From => &self.from,
            LinkEnd::To => &self.to,
        }
    }
}

/// One end of a link type.
///
/// `required`/`singular` constrain how many links each record listed on this
/// side has through the link type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkSide {
    /// Rectypes permitted at this end.
    pub link_rectypes: BTreeSet<String>,
    /// Name under which this side's records see the link.
    pub name: Option<String>,
    /// At most one link per record.
    pub singular: bool,
    /// At least one link per record.
    pub required: bool,
}

/// Which end of a link a record sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkEnd {
    /// The record is the link's source.
    From,
    /// The record is the link's target.
    To,
}

impl std::fmt::Display for LinkEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::From => "from",
            Self::To => "to",
        })
    }
}

impl Template {
    /// Parses and validates a JSON template document.
    ///
    /// # Errors
    ///
    /// Returns the first [`SchemaError`] found.
    pub fn parse(raw: &[u8]) -> Result<Self, SchemaError> {
        validate::validate(raw)
    }

    pub(crate) fn assemble(
        rectypes: BTreeMap<String, Rectype>,
        linktypes: BTreeMap<String, LinkType>,
        canonical: Vec<u8>,
    ) -> Self {
        let hash = blob_hash(&canonical);
        Self {
            rectypes,
            linktypes,
            canonical,
            hash,
            attributes: RwLock::new(HashMap::new()),
        }
    }

    /// Hash of the canonical serialization; the template's blob id.
    pub fn hash(&self) -> BlobHash {
        self.hash
    }

    /// Compact, key-sorted JSON persisted as the template blob.
    pub fn canonical_bytes(&self) -> &[u8] {
        &self.canonical
    }

    /// Looks up a rectype.
    pub fn rectype(&self, name: &str) -> Option<&Rectype> {
        self.rectypes.get(name)
    }

    /// All rectypes by name.
    pub fn rectypes(&self) -> &BTreeMap<String, Rectype> {
        &self.rectypes
    }

    /// Looks up a link type.
    pub fn linktype(&self, name: &str) -> Option<&LinkType> {
        self.linktypes.get(name)
    }

    /// All link types by name.
    pub fn linktypes(&self) -> &BTreeMap<String, LinkType> {
        &self.linktypes
    }

    /// Resolved attributes of `rectype.field`, memoized. `None` if the field
    /// is not declared.
    pub fn field_attributes(&self, rectype: &str, field: &str) -> Option<Arc<FieldAttributes>> {
        let key = format!("{rectype}.{field}");
        if let Some(hit) = self
            .attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Some(Arc::clone(hit));
        }
        let spec = self.rectypes.get(rectype)?.fields.get(field)?;
        let resolved = Arc::new(FieldAttributes::resolve(rectype, field, spec));
        self.attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&resolved));
        Some(resolved)
    }

    /// Link types `rectype` may participate in, with the end it sits on.
    /// A self-referential link type yields both ends.
    pub fn link_ends(&self, rectype: &str) -> Vec<(&LinkType, LinkEnd)> {
        let mut out = Vec::new();
        for lt in self.linktypes.values() {
            if lt.from.link_rectypes.contains(rectype) {
                out.push((lt, LinkEnd::From));
            }
            if lt.to.link_rectypes.contains(rectype) {
                out.push((lt, LinkEnd::To));
            }
        }
        out
    }

    /// Every calculated field as `(rectype, field, calculation)`.
    pub fn calculated_fields(&self) -> Vec<(&str, &str, &Calculated)> {
        self.rectypes
            .values()
            .flat_map(|rt| {
                rt.fields.iter().filter_map(move |(name, spec)| {
                    spec.calculated
                        .as_ref()
                        .map(|calc| (rt.name.as_str(), name.as_str(), calc))
                })
            })
            .collect()
    }

    /// Rectypes whose records may be affected by replacing `previous` with
    /// this template: rectypes added, removed or redefined, plus every rectype
    /// on either side of a link type that was added, removed or redefined.
    pub fn touched_rectypes(&self, previous: Option<&Template>) -> BTreeSet<String> {
        let Some(previous) = previous else {
            return self.rectypes.keys().cloned().collect();
        };
        let mut touched = BTreeSet::new();
        let names: BTreeSet<&String> = self
            .rectypes
            .keys()
            .chain(previous.rectypes.keys())
            .collect();
        for name in names {
            if self.rectypes.get(name) != previous.rectypes.get(name) {
                touched.insert(name.clone());
            }
        }
        let links: BTreeSet<&String> = self
            .linktypes
            .keys()
            .chain(previous.linktypes.keys())
            .collect();
        for name in links {
            let now = self.linktypes.get(name);
            let before = previous.linktypes.get(name);
            if now != before {
                for lt in now.into_iter().chain(before) {
                    touched.extend(lt.from.link_rectypes.iter().cloned());
                    touched.extend(lt.to.link_rectypes.iter().cloned());
                }
            }
        }
        touched
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const BASE: &str = r#"{
        "rectypes": {
            "order": { "fields": { "note": { "datatype": "string" } } },
            "item": { "fields": { "qty": { "datatype": "int" } } },
            "tag": { "fields": { "label": { "datatype": "string" } } }
        },
        "directed_linktypes": {
            "has_items": { "from": { "link_rectypes": ["order"] }, "to": { "link_rectypes": ["item"] } }
        }
    }"#;

    #[test]
    fn field_attributes_are_memoized() {
        let t = Template::parse(BASE.as_bytes()).unwrap();
        let a = t.field_attributes("item", "qty").unwrap();
        let b = t.field_attributes("item", "qty").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(t.field_attributes("item", "nope").is_none());
        assert!(t.field_attributes("nope", "qty").is_none());
    }

    #[test]
    fn canonical_bytes_ignore_formatting() {
        let a = Template::parse(BASE.as_bytes()).unwrap();
        let compact: serde_json::Value = serde_json::from_str(BASE).unwrap();
        let b = Template::parse(compact.to_string().as_bytes()).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
    }

    #[test]
    fn touched_rectypes_follow_link_changes() {
        let before = Template::parse(BASE.as_bytes()).unwrap();
        let after_raw = BASE.replace(
            r#""to": { "link_rectypes": ["item"] }"#,
            r#""to": { "link_rectypes": ["item"], "required": true }"#,
        );
        let after = Template::parse(after_raw.as_bytes()).unwrap();
        let touched: Vec<String> = after.touched_rectypes(Some(&before)).into_iter().collect();
        assert_eq!(touched, ["item", "order"]);
        assert!(before.touched_rectypes(Some(&before)).is_empty());
    }

    #[test]
    fn link_ends_lists_both_sides() {
        let t = Template::parse(BASE.as_bytes()).unwrap();
        let ends: Vec<LinkEnd> = t.link_ends("item").into_iter().map(|(_, e)| e).collect();
        assert_eq!(ends, [LinkEnd::To]);
        assert!(t.link_ends("tag").is_empty());
    }
}

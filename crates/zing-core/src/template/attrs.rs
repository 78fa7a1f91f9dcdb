// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Resolved per-field constraint bundles.
use std::collections::HashSet;

use super::{AutoMerge, Calculated, DefaultSpec, FieldSpec, UniquifyPolicy};
use crate::constraint::ViolationKind;
use crate::value::{DataType, Value};

/// Everything the engine needs to check and merge one field, flattened out of
/// the template so hot paths do a single lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldAttributes {
    /// Owning rectype.
    pub rectype: String,
    /// Field name.
    pub field: String,
    /// Declared datatype.
    pub datatype: DataType,
    /// Must be set at commit.
    pub required: bool,
    /// Value must be unique among live records.
    pub unique: bool,
    /// Numeric lower bound.
    pub min: Option<i64>,
    /// Numeric upper bound.
    pub max: Option<i64>,
    /// Minimum length in characters.
    pub min_length: Option<usize>,
    /// Maximum length in characters.
    pub max_length: Option<usize>,
    /// Whitelist of encoded values.
    pub allowed: Option<HashSet<String>>,
    /// Blacklist of encoded values.
    pub prohibited: Option<HashSet<String>>,
    /// Initial value source.
    pub default: Option<DefaultSpec>,
    /// Aggregate definition, if calculated.
    pub calculated: Option<Calculated>,
    /// Ordered automerge policies.
    pub auto_merge: Vec<AutoMerge>,
    /// Uniquify repair.
    pub uniquify: Option<UniquifyPolicy>,
}

impl FieldAttributes {
    pub(crate) fn resolve(rectype: &str, field: &str, spec: &FieldSpec) -> Self {
        let c = &spec.constraints;
        Self {
            rectype: rectype.to_owned(),
            field: field.to_owned(),
            datatype: spec.datatype,
            required: c.required,
            unique: c.unique,
            min: c.min,
            max: c.max,
            min_length: c.min_length,
            max_length: c.max_length,
            allowed: c.allowed.as_ref().map(|v| v.iter().cloned().collect()),
            prohibited: c.prohibited.as_ref().map(|v| v.iter().cloned().collect()),
            default: c.default.clone(),
            calculated: spec.calculated.clone(),
            auto_merge: spec.merge.auto.clone(),
            uniquify: spec.merge.uniqify.clone(),
        }
    }

    /// Runs the inline checks (bounds, length, allowed, prohibited) on a
    /// typed value. Required and unique are commit-time checks.
    ///
    /// # Errors
    ///
    /// Returns the kind of the first failed check.
    pub fn check_value(&self, value: &Value) -> Result<(), ViolationKind> {
        if let Some(n) = value.as_int() {
            if self.min.is_some_and(|min| n < min) {
                return Err(ViolationKind::Min);
            }
            if self.max.is_some_and(|max| n > max) {
                return Err(ViolationKind::Max);
            }
        }
        if let Some(text) = value.as_text() {
            let len = text.chars().count();
            if self.min_length.is_some_and(|min| len < min) {
                return Err(ViolationKind::MinLength);
            }
            if self.max_length.is_some_and(|max| len > max) {
                return Err(ViolationKind::MaxLength);
            }
        }
        let encoded = value.encode();
        if self.allowed.as_ref().is_some_and(|set| !set.contains(&encoded)) {
            return Err(ViolationKind::NotAllowed);
        }
        if self.prohibited.as_ref().is_some_and(|set| set.contains(&encoded)) {
            return Err(ViolationKind::Prohibited);
        }
        Ok(())
    }

    /// Decodes a stored value and runs [`check_value`](Self::check_value).
    ///
    /// # Errors
    ///
    /// [`ViolationKind::Malformed`] if the text does not decode.
    pub fn check_encoded(&self, text: &str) -> Result<(), ViolationKind> {
        let value = Value::decode(self.datatype, text).map_err(|_| ViolationKind::Malformed)?;
        self.check_value(&value)
    }
}

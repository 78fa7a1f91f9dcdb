// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Constraint violations reported by setters and by the commit-time checker.
use std::collections::BTreeSet;
use std::fmt;

use crate::ident::RecId;

/// What a violation is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ViolationKind {
    /// A required field has no value.
    Required,
    /// Value below `min`.
    Min,
    /// Value above `max`.
    Max,
    /// Text shorter than `minlength`.
    MinLength,
    /// Text longer than `maxlength`.
    MaxLength,
    /// Value not in `allowed`.
    NotAllowed,
    /// Value in `prohibited`.
    Prohibited,
    /// More than one live record shares a `unique` value.
    Unique,
    /// A required link side has no link.
    RequiredLink,
    /// A singular link side has more than one link.
    SingularLink,
    /// The record's rectype is not in the template.
    UnknownRectype,
    /// The record stores a field the template does not declare.
    UnknownField,
    /// A stored value does not parse as the field's datatype.
    Malformed,
}

impl ViolationKind {
    /// Stable snake-case name used in messages and logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Required => "required",
            Self::Min => "min",
            Self::Max => "max",
            Self::MinLength => "minlength",
            Self::MaxLength => "maxlength",
            Self::NotAllowed => "allowed",
            Self::Prohibited => "prohibited",
            Self::Unique => "unique",
            Self::RequiredLink => "required_link",
            Self::SingularLink => "singular_link",
            Self::UnknownRectype => "unknown_rectype",
            Self::UnknownField => "unknown_field",
            Self::Malformed => "malformed",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One constraint violation.
///
/// For link violations `field_name` holds the link name. For uniqueness,
/// `conflicting` lists every live record that shares the value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// Kind of violation.
    pub kind: ViolationKind,
    /// Offending record.
    pub recid: RecId,
    /// Rectype of the offending record.
    pub rectype: String,
    /// Field or link concerned.
    pub field_name: Option<String>,
    /// Offending value, when there is one.
    pub field_value: Option<String>,
    /// All records sharing a `unique` value.
    pub conflicting: BTreeSet<RecId>,
}

impl Violation {
    /// Violation attached to a field.
    pub fn field(
        kind: ViolationKind,
        recid: &RecId,
        rectype: &str,
        field: &str,
        value: Option<&str>,
    ) -> Self {
        Self {
            kind,
            recid: recid.clone(),
            rectype: rectype.to_owned(),
            field_name: Some(field.to_owned()),
            field_value: value.map(str::to_owned),
            conflicting: BTreeSet::new(),
        }
    }

    /// Violation attached to the record as a whole.
    pub fn record(kind: ViolationKind, recid: &RecId, rectype: &str) -> Self {
        Self {
            kind,
            recid: recid.clone(),
            rectype: rectype.to_owned(),
            field_name: None,
            field_value: None,
            conflicting: BTreeSet::new(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} {}", self.kind, self.rectype, self.recid)?;
        if let Some(field) = &self.field_name {
            write!(f, ".{field}")?;
        }
        if let Some(value) = &self.field_value {
            write!(f, " = {value:?}")?;
        }
        if !self.conflicting.is_empty() {
            write!(f, " (shared by {} records)", self.conflicting.len())?;
        }
        Ok(())
    }
}

/// Every violation found by one commit attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConstraintViolations(pub Vec<Violation>);

impl ConstraintViolations {
    /// Number of violations.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` if nothing was violated.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates the violations.
    pub fn iter(&self) -> std::slice::Iter<'_, Violation> {
        self.0.iter()
    }

    /// `true` if at least one violation has `kind`.
    pub fn has_kind(&self, kind: ViolationKind) -> bool {
        self.0.iter().any(|v| v.kind == kind)
    }
}

impl fmt::Display for ConstraintViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} constraint violation(s)", self.0.len())?;
        for v in &self.0 {
            write!(f, "; {v}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a ConstraintViolations {
    type Item = &'a Violation;
    type IntoIter = std::slice::Iter<'a, Violation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

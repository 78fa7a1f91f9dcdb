// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Typed field values and their canonical string encoding.
//!
//! Records store every field as a string. The engine never hands those strings
//! to callers for mutation: setters take a [`Value`], which is type-checked
//! against the field's [`DataType`] and encoded exactly once, at the record
//! boundary.
//!
//! Canonical encodings:
//!
//! | datatype | encoding |
//! |---|---|
//! | `bool` | `"1"` / `"0"` |
//! | `int` | decimal `i64` |
//! | `datetime` | decimal Unix seconds (`i64`) |
//! | `string`, `userid`, `dagnode`, `attachment` | the text itself |
use thiserror::Error;

/// Declared datatype of a template field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataType {
    /// Boolean flag.
    Bool,
    /// Signed 64-bit integer.
    Int,
    /// Point in time, Unix seconds.
    DateTime,
    /// Free text.
    String,
    /// Name of a repository user.
    UserId,
    /// Reference to a changeset node.
    Dagnode,
    /// Reference to an attachment blob.
    Attachment,
}

impl DataType {
    /// Parses a template datatype name.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "bool" => Self::Bool,
            "int" => Self::Int,
            "datetime" => Self::DateTime,
            "string" => Self::String,
            "userid" => Self::UserId,
            "dagnode" => Self::Dagnode,
            "attachment" => Self::Attachment,
            _ => return None,
        })
    }

    /// Template spelling of this datatype.
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::DateTime => "datetime",
            Self::String => "string",
            Self::UserId => "userid",
            Self::Dagnode => "dagnode",
            Self::Attachment => "attachment",
        }
    }

    /// `int` and `datetime`: the types `min`/`max` apply to.
    pub fn is_ordered_number(self) -> bool {
        matches!(self, Self::Int | Self::DateTime)
    }

    /// Types whose value is free text.
    pub fn is_textual(self) -> bool {
        matches!(
            self,
            Self::String | Self::UserId | Self::Dagnode | Self::Attachment
        )
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed field value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// `bool` value.
    Bool(bool),
    /// `int` value.
    Int(i64),
    /// `datetime` value, Unix seconds.
    DateTime(i64),
    /// `string` value.
    String(String),
    /// `userid` value.
    UserId(String),
    /// `dagnode` value.
    Dagnode(String),
    /// `attachment` value.
    Attachment(String),
}

impl Value {
    /// Datatype carried by this value.
    pub fn datatype(&self) -> DataType {
        match self {
            Self::Bool(_) => DataType::Bool,
            Self::Int(_) => DataType::Int,
            Self::DateTime(_) => DataType::DateTime,
            Self::String(_) => DataType::String,
            Self::UserId(_) => DataType::UserId,
            Self::Dagnode(_) => DataType::Dagnode,
            Self::Attachment(_) => DataType::Attachment,
        }
    }

    /// Canonical string form stored in records.
    pub fn encode(&self) -> String {
        match self {
            Self::Bool(true) => "1".to_owned(),
            Self::Bool(false) => "0".to_owned(),
            Self::Int(n) | Self::DateTime(n) => n.to_string(),
            Self::String(s) | Self::UserId(s) | Self::Dagnode(s) | Self::Attachment(s) => {
                s.clone()
            }
        }
    }

    /// Parses a stored string as a value of `datatype`.
    ///
    /// # Errors
    ///
    /// Returns [`ValueError::Malformed`] if `text` is not a canonical encoding
    /// for `datatype`.
    pub fn decode(datatype: DataType, text: &str) -> Result<Self, ValueError> {
        let malformed = || ValueError::Malformed {
            datatype,
            text: text.to_owned(),
        };
        Ok(match datatype {
            DataType::Bool => match text {
                "1" => Self::Bool(true),
                "0" => Self::Bool(false),
                _ => return Err(malformed()),
            },
            DataType::Int => Self::Int(parse_canonical_int(text).ok_or_else(malformed)?),
            DataType::DateTime => {
                Self::DateTime(parse_canonical_int(text).ok_or_else(malformed)?)
            }
            DataType::String => Self::String(text.to_owned()),
            DataType::UserId => Self::UserId(text.to_owned()),
            DataType::Dagnode => Self::Dagnode(text.to_owned()),
            DataType::Attachment => Self::Attachment(text.to_owned()),
        })
    }

    /// Integer payload of an `int` or `datetime` value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) | Self::DateTime(n) => Some(*n),
            _ => None,
        }
    }

    /// Text payload of a textual value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::UserId(s) | Self::Dagnode(s) | Self::Attachment(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Only the exact `i64::to_string` form is accepted, so every stored integer
/// has one spelling and equal values hash equally.
fn parse_canonical_int(text: &str) -> Option<i64> {
    let n: i64 = text.parse().ok()?;
    (n.to_string() == text).then_some(n)
}

/// Errors raised while decoding a stored value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    /// The stored text is not a canonical encoding for the datatype.
    #[error("`{text}` is not a valid {datatype} value")]
    Malformed {
        /// Expected datatype.
        datatype: DataType,
        /// Offending text.
        text: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn datatype_names_round_trip() {
        for dt in [
            DataType::Bool,
            DataType::Int,
            DataType::DateTime,
            DataType::String,
            DataType::UserId,
            DataType::Dagnode,
            DataType::Attachment,
        ] {
            assert_eq!(DataType::parse(dt.name()), Some(dt));
        }
        assert_eq!(DataType::parse("float"), None);
    }

    #[test]
    fn bool_encodes_as_digit() {
        assert_eq!(Value::Bool(true).encode(), "1");
        assert_eq!(Value::decode(DataType::Bool, "0").unwrap(), Value::Bool(false));
        assert!(Value::decode(DataType::Bool, "true").is_err());
    }

    #[test]
    fn ints_must_be_canonical() {
        assert_eq!(Value::decode(DataType::Int, "-42").unwrap(), Value::Int(-42));
        assert!(Value::decode(DataType::Int, "007").is_err());
        assert!(Value::decode(DataType::Int, "+7").is_err());
        assert!(Value::decode(DataType::DateTime, "").is_err());
    }

    #[test]
    fn text_types_keep_their_tag() {
        let v = Value::decode(DataType::UserId, "alice").unwrap();
        assert_eq!(v, Value::UserId("alice".into()));
        assert_eq!(v.as_text(), Some("alice"));
        assert_eq!(v.as_int(), None);
    }
}

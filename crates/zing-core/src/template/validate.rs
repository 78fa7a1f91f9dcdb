// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Whole-document template validation.
//!
//! Every object in the document is checked for required and permitted
//! members, every constraint value is type-checked against its field's
//! datatype, and cross references (link sides, calculated fields) are
//! resolved. The first problem found is reported with a JSON-path style
//! location such as `$.rectypes.order.fields.total.calculated`.
use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value as Json};
use thiserror::Error;
use tracing::debug;

use super::{
    AutoMerge, Builtin, Calculated, Constraints, DefaultSpec, FieldSpec, Generator, LinkSide,
    LinkType, MergeSpec, MergeType, Rectype, Template, UniquifyOp, UniquifyPolicy, UniquifyWhich,
};
use crate::record::is_reserved;
use crate::value::{DataType, Value};

/// Only supported document version.
const TEMPLATE_VERSION: i64 = 1;

const CONSTRAINT_NAMES: [&str; 10] = [
    "required",
    "min",
    "max",
    "minlength",
    "maxlength",
    "allowed",
    "prohibited",
    "unique",
    "defaultvalue",
    "defaultfunc",
];

/// A template document failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[SCHEMA] {path}: {kind}")]
pub struct SchemaError {
    /// Location of the problem.
    pub path: String,
    /// What is wrong.
    pub kind: SchemaErrorKind,
}

impl SchemaError {
    fn at(path: &str, kind: SchemaErrorKind) -> Self {
        Self {
            path: path.to_owned(),
            kind,
        }
    }
}

/// Kinds of template validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaErrorKind {
    /// The document is not JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    /// `version` is not a supported value.
    #[error("unsupported template version {0}")]
    UnsupportedVersion(String),
    /// A value has the wrong JSON type.
    #[error("expected {0}")]
    WrongType(&'static str),
    /// A required member is absent.
    #[error("missing member `{0}`")]
    MissingMember(String),
    /// A member is not permitted here.
    #[error("unknown member `{0}`")]
    UnknownMember(String),
    /// A name is not an identifier.
    #[error("`{0}` is not a valid name")]
    InvalidName(String),
    /// A name is reserved by the engine.
    #[error("`{0}` is a reserved name")]
    ReservedName(String),
    /// Unknown datatype name.
    #[error("unknown datatype `{0}`")]
    UnknownDatatype(String),
    /// A constraint does not apply to the field's datatype.
    #[error("constraint `{constraint}` does not apply to {datatype}")]
    ConstraintNotApplicable {
        /// Constraint name.
        constraint: String,
        /// Field datatype.
        datatype: DataType,
    },
    /// A list repeats a value.
    #[error("duplicate value `{0}`")]
    DuplicateValue(String),
    /// `allowed` and `prohibited` on one field.
    #[error("allowed and prohibited are mutually exclusive")]
    AllowedAndProhibited,
    /// `defaultvalue` and `defaultfunc` on one field.
    #[error("defaultvalue and defaultfunc are mutually exclusive")]
    ConflictingDefaults,
    /// The default is not in `allowed`.
    #[error("default `{0}` is not in allowed")]
    DefaultNotAllowed(String),
    /// The default is in `prohibited`.
    #[error("default `{0}` is prohibited")]
    DefaultProhibited(String),
    /// The default violates min/max or a length bound.
    #[error("default `{0}` is out of bounds")]
    DefaultOutOfBounds(String),
    /// `max < min` or `maxlength < minlength`.
    #[error("upper bound is below lower bound")]
    BoundsInverted,
    /// A parameter has an unusable value.
    #[error("invalid value for `{0}`")]
    InvalidParameter(&'static str),
    /// Unknown operator, builtin, policy or merge type name.
    #[error("unknown operator `{0}`")]
    UnknownOperator(String),
    /// An operator does not apply to the field's datatype.
    #[error("operator `{op}` does not apply to {datatype}")]
    OperatorNotApplicable {
        /// Operator name.
        op: String,
        /// Field datatype.
        datatype: DataType,
    },
    /// `uniqify` on a field that is not `unique`.
    #[error("uniqify requires a unique field")]
    UniquifyWithoutUnique,
    /// Reference to an undeclared rectype.
    #[error("unknown rectype `{0}`")]
    UnknownRectype(String),
    /// Reference to an undeclared link type.
    #[error("unknown link type `{0}`")]
    UnknownLink(String),
    /// A link side name equals a field name on that side.
    #[error("`{0}` collides with a field name")]
    NameCollision(String),
    /// A calculated field cannot be resolved.
    #[error("{0}")]
    InvalidCalculation(String),
    /// Calculated fields depend on each other in a loop.
    #[error("calculated fields form a cycle: {0}")]
    DependencyCycle(String),
}

pub(crate) fn validate(raw: &[u8]) -> Result<Template, SchemaError> {
    let doc: Json = serde_json::from_slice(raw)
        .map_err(|e| SchemaError::at("$", SchemaErrorKind::InvalidJson(e.to_string())))?;
    let root = object(&doc, "$")?;
    members(root, "$", &["rectypes"], &["version", "directed_linktypes"])?;
    if let Some(version) = root.get("version") {
        if version.as_i64() != Some(TEMPLATE_VERSION) {
            return Err(SchemaError::at(
                "$.version",
                SchemaErrorKind::UnsupportedVersion(version.to_string()),
            ));
        }
    }

    let mut rectypes = BTreeMap::new();
    for (name, body) in object(member(root, "rectypes", "$")?, "$.rectypes")? {
        let path = format!("$.rectypes.{name}");
        check_name(name, &path)?;
        rectypes.insert(name.clone(), parse_rectype(name, body, &path)?);
    }

    let mut linktypes = BTreeMap::new();
    if let Some(links) = root.get("directed_linktypes") {
        for (name, body) in object(links, "$.directed_linktypes")? {
            let path = format!("$.directed_linktypes.{name}");
            check_name(name, &path)?;
            linktypes.insert(name.clone(), parse_linktype(name, body, &path, &rectypes)?);
        }
    }

    check_calculations(&rectypes, &linktypes)?;
    check_cycles(&rectypes, &linktypes)?;

    let canonical = serde_json::to_vec(&canonicalize(&doc))
        .map_err(|e| SchemaError::at("$", SchemaErrorKind::InvalidJson(e.to_string())))?;
    debug!(
        rectypes = rectypes.len(),
        linktypes = linktypes.len(),
        "template validated"
    );
    Ok(Template::assemble(rectypes, linktypes, canonical))
}

fn parse_rectype(name: &str, body: &Json, path: &str) -> Result<Rectype, SchemaError> {
    let obj = object(body, path)?;
    members(obj, path, &["fields"], &["no_recid", "merge_type"])?;
    let merge_type = match opt_str(obj, "merge_type", path)? {
        None | Some("field") => MergeType::Field,
        Some("record") => MergeType::Record,
        Some(other) => {
            return Err(SchemaError::at(
                &child(path, "merge_type"),
                SchemaErrorKind::UnknownOperator(other.to_owned()),
            ))
        }
    };
    let fields_path = child(path, "fields");
    let mut fields = BTreeMap::new();
    for (fname, fbody) in object(member(obj, "fields", path)?, &fields_path)? {
        let fpath = child(&fields_path, fname);
        check_name(fname, &fpath)?;
        fields.insert(fname.clone(), parse_field(fbody, &fpath)?);
    }
    Ok(Rectype {
        name: name.to_owned(),
        fields,
        no_recid: opt_bool(obj, "no_recid", path)?.unwrap_or(false),
        merge_type,
    })
}

fn parse_field(body: &Json, path: &str) -> Result<FieldSpec, SchemaError> {
    let obj = object(body, path)?;
    members(obj, path, &["datatype"], &["constraints", "calculated", "merge"])?;
    let dt_name = req_str(obj, "datatype", path)?;
    let datatype = DataType::parse(dt_name).ok_or_else(|| {
        SchemaError::at(
            &child(path, "datatype"),
            SchemaErrorKind::UnknownDatatype(dt_name.to_owned()),
        )
    })?;
    let constraints = obj
        .get("constraints")
        .map(|c| parse_constraints(c, datatype, &child(path, "constraints")))
        .transpose()?
        .unwrap_or_default();
    let calculated = obj
        .get("calculated")
        .map(|c| parse_calculated(c, datatype, &child(path, "calculated")))
        .transpose()?;
    if calculated.is_some() && (constraints.default.is_some() || constraints.unique) {
        return Err(SchemaError::at(
            path,
            SchemaErrorKind::InvalidCalculation(
                "calculated fields take no default and cannot be unique".to_owned(),
            ),
        ));
    }
    let merge = obj
        .get("merge")
        .map(|m| parse_merge(m, datatype, constraints.unique, &child(path, "merge")))
        .transpose()?
        .unwrap_or_default();
    Ok(FieldSpec {
        datatype,
        constraints,
        calculated,
        merge,
    })
}

fn constraint_applies(name: &str, datatype: DataType) -> bool {
    match name {
        "required" | "defaultvalue" => true,
        "min" | "max" => datatype.is_ordered_number(),
        "minlength" | "maxlength" => datatype.is_textual(),
        "allowed" | "prohibited" | "unique" => {
            matches!(datatype, DataType::Int | DataType::String)
        }
        "defaultfunc" => datatype == DataType::String,
        _ => false,
    }
}

fn parse_constraints(body: &Json, datatype: DataType, path: &str) -> Result<Constraints, SchemaError> {
    let obj = object(body, path)?;
    for key in obj.keys() {
        if !CONSTRAINT_NAMES.contains(&key.as_str()) {
            return Err(SchemaError::at(
                path,
                SchemaErrorKind::UnknownMember(key.clone()),
            ));
        }
        if !constraint_applies(key, datatype) {
            return Err(SchemaError::at(
                &child(path, key),
                SchemaErrorKind::ConstraintNotApplicable {
                    constraint: key.clone(),
                    datatype,
                },
            ));
        }
    }

    let min = opt_int(obj, "min", path)?;
    let max = opt_int(obj, "max", path)?;
    if let (Some(lo), Some(hi)) = (min, max) {
        if hi < lo {
            return Err(SchemaError::at(&child(path, "max"), SchemaErrorKind::BoundsInverted));
        }
    }
    let min_length = opt_usize(obj, "minlength", path)?;
    let max_length = opt_usize(obj, "maxlength", path)?;
    if let (Some(lo), Some(hi)) = (min_length, max_length) {
        if hi < lo {
            return Err(SchemaError::at(
                &child(path, "maxlength"),
                SchemaErrorKind::BoundsInverted,
            ));
        }
    }
    let allowed = opt_value_list(obj, "allowed", datatype, path)?;
    let prohibited = opt_value_list(obj, "prohibited", datatype, path)?;
    if allowed.is_some() && prohibited.is_some() {
        return Err(SchemaError::at(path, SchemaErrorKind::AllowedAndProhibited));
    }

    let default = match (obj.get("defaultvalue"), obj.get("defaultfunc")) {
        (Some(_), Some(_)) => {
            return Err(SchemaError::at(path, SchemaErrorKind::ConflictingDefaults));
        }
        (Some(v), None) => Some(parse_default(v, datatype, &child(path, "defaultvalue"))?),
        (None, Some(f)) => Some(DefaultSpec::Generate(parse_generator(
            f,
            &child(path, "defaultfunc"),
        )?)),
        (None, None) => None,
    };

    let constraints = Constraints {
        required: opt_bool(obj, "required", path)?.unwrap_or(false),
        min,
        max,
        min_length,
        max_length,
        allowed,
        prohibited,
        unique: opt_bool(obj, "unique", path)?.unwrap_or(false),
        default,
    };
    if let Some(DefaultSpec::Literal(value)) = &constraints.default {
        check_literal_default(value, &constraints, &child(path, "defaultvalue"))?;
    }
    Ok(constraints)
}

fn check_literal_default(value: &Value, c: &Constraints, path: &str) -> Result<(), SchemaError> {
    let encoded = value.encode();
    if c.allowed.as_ref().is_some_and(|a| !a.contains(&encoded)) {
        return Err(SchemaError::at(path, SchemaErrorKind::DefaultNotAllowed(encoded)));
    }
    if c.prohibited.as_ref().is_some_and(|p| p.contains(&encoded)) {
        return Err(SchemaError::at(path, SchemaErrorKind::DefaultProhibited(encoded)));
    }
    let numeric_ok = value
        .as_int()
        .map_or(true, |n| c.min.map_or(true, |m| n >= m) && c.max.map_or(true, |m| n <= m));
    let length_ok = value.as_text().map_or(true, |t| {
        let len = t.chars().count();
        c.min_length.map_or(true, |m| len >= m) && c.max_length.map_or(true, |m| len <= m)
    });
    if !(numeric_ok && length_ok) {
        return Err(SchemaError::at(path, SchemaErrorKind::DefaultOutOfBounds(encoded)));
    }
    Ok(())
}

fn json_to_value(json: &Json, datatype: DataType) -> Option<Value> {
    Some(match datatype {
        DataType::Bool => Value::Bool(json.as_bool()?),
        DataType::Int => Value::Int(json.as_i64()?),
        DataType::DateTime => Value::DateTime(json.as_i64()?),
        DataType::String => Value::String(json.as_str()?.to_owned()),
        DataType::UserId => Value::UserId(json.as_str()?.to_owned()),
        DataType::Dagnode => Value::Dagnode(json.as_str()?.to_owned()),
        DataType::Attachment => Value::Attachment(json.as_str()?.to_owned()),
    })
}

fn expected(datatype: DataType) -> SchemaErrorKind {
    SchemaErrorKind::WrongType(match datatype {
        DataType::Bool => "boolean",
        DataType::Int | DataType::DateTime => "integer",
        _ => "string",
    })
}

fn parse_default(json: &Json, datatype: DataType, path: &str) -> Result<DefaultSpec, SchemaError> {
    match (datatype, json.as_str()) {
        (DataType::DateTime, Some("now")) => return Ok(DefaultSpec::Now),
        (DataType::UserId, Some("whoami")) => return Ok(DefaultSpec::WhoAmI),
        _ => {}
    }
    json_to_value(json, datatype)
        .map(DefaultSpec::Literal)
        .ok_or_else(|| SchemaError::at(path, expected(datatype)))
}

fn opt_value_list(
    obj: &Map<String, Json>,
    key: &str,
    datatype: DataType,
    path: &str,
) -> Result<Option<Vec<String>>, SchemaError> {
    let Some(list) = obj.get(key) else {
        return Ok(None);
    };
    let path = child(path, key);
    let items = list
        .as_array()
        .ok_or_else(|| SchemaError::at(&path, SchemaErrorKind::WrongType("array")))?;
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let encoded = json_to_value(item, datatype)
            .ok_or_else(|| SchemaError::at(&path, expected(datatype)))?
            .encode();
        if !seen.insert(encoded.clone()) {
            return Err(SchemaError::at(&path, SchemaErrorKind::DuplicateValue(encoded)));
        }
        out.push(encoded);
    }
    Ok(Some(out))
}

fn parse_generator(json: &Json, path: &str) -> Result<Generator, SchemaError> {
    let (name, obj) = match json {
        Json::String(s) => (s.as_str(), None),
        Json::Object(o) => {
            members(o, path, &["name"], &["length", "alphabet"])?;
            (req_str(o, "name", path)?, Some(o))
        }
        _ => {
            return Err(SchemaError::at(
                path,
                SchemaErrorKind::WrongType("string or object"),
            ))
        }
    };
    let length = obj.map(|o| opt_usize(o, "length", path)).transpose()?.flatten();
    let alphabet = obj
        .map(|o| opt_str(o, "alphabet", path))
        .transpose()?
        .flatten()
        .map(str::to_owned);
    generator(name, length, alphabet, path)
}

fn generator(
    name: &str,
    length: Option<usize>,
    alphabet: Option<String>,
    path: &str,
) -> Result<Generator, SchemaError> {
    if length == Some(0) {
        return Err(SchemaError::at(
            &child(path, "length"),
            SchemaErrorKind::InvalidParameter("length"),
        ));
    }
    if alphabet.as_deref() == Some("") {
        return Err(SchemaError::at(
            &child(path, "alphabet"),
            SchemaErrorKind::InvalidParameter("alphabet"),
        ));
    }
    match name {
        "gen_random_unique" => Ok(Generator::RandomUnique { length, alphabet }),
        "gen_userprefix_unique" if alphabet.is_some() => Err(SchemaError::at(
            path,
            SchemaErrorKind::UnknownMember("alphabet".to_owned()),
        )),
        "gen_userprefix_unique" => Ok(Generator::UserPrefixUnique { length }),
        other => Err(SchemaError::at(
            path,
            SchemaErrorKind::UnknownOperator(other.to_owned()),
        )),
    }
}

fn parse_calculated(body: &Json, datatype: DataType, path: &str) -> Result<Calculated, SchemaError> {
    let obj = object(body, path)?;
    members(obj, path, &["builtin", "depends_on"], &["field_from"])?;
    let name = req_str(obj, "builtin", path)?;
    let builtin = Builtin::parse(name).ok_or_else(|| {
        SchemaError::at(
            &child(path, "builtin"),
            SchemaErrorKind::UnknownOperator(name.to_owned()),
        )
    })?;
    let fits = match builtin {
        Builtin::Min | Builtin::Max => datatype.is_ordered_number(),
        Builtin::Sum | Builtin::Count | Builtin::Average => datatype == DataType::Int,
    };
    if !fits {
        return Err(SchemaError::at(
            &child(path, "builtin"),
            SchemaErrorKind::OperatorNotApplicable {
                op: name.to_owned(),
                datatype,
            },
        ));
    }
    let field_from = opt_str(obj, "field_from", path)?.map(str::to_owned);
    match (builtin, &field_from) {
        (Builtin::Count, Some(_)) => {
            return Err(SchemaError::at(
                path,
                SchemaErrorKind::UnknownMember("field_from".to_owned()),
            ))
        }
        (Builtin::Count, None) | (_, Some(_)) => {}
        (_, None) => {
            return Err(SchemaError::at(
                path,
                SchemaErrorKind::MissingMember("field_from".to_owned()),
            ))
        }
    }
    Ok(Calculated {
        builtin,
        field_from,
        depends_on: req_str(obj, "depends_on", path)?.to_owned(),
    })
}

fn parse_merge(
    body: &Json,
    datatype: DataType,
    unique: bool,
    path: &str,
) -> Result<MergeSpec, SchemaError> {
    let obj = object(body, path)?;
    members(obj, path, &[], &["auto", "uniqify"])?;
    let mut auto = Vec::new();
    if let Some(list) = obj.get("auto") {
        let auto_path = child(path, "auto");
        let items = list
            .as_array()
            .ok_or_else(|| SchemaError::at(&auto_path, SchemaErrorKind::WrongType("array")))?;
        for item in items {
            let entry = object(item, &auto_path)?;
            members(entry, &auto_path, &["op"], &[])?;
            let name = req_str(entry, "op", &auto_path)?;
            let op = AutoMerge::parse(name).ok_or_else(|| {
                SchemaError::at(&auto_path, SchemaErrorKind::UnknownOperator(name.to_owned()))
            })?;
            if !op.applies_to(datatype) {
                return Err(SchemaError::at(
                    &auto_path,
                    SchemaErrorKind::OperatorNotApplicable {
                        op: name.to_owned(),
                        datatype,
                    },
                ));
            }
            if auto.contains(&op) {
                return Err(SchemaError::at(
                    &auto_path,
                    SchemaErrorKind::DuplicateValue(name.to_owned()),
                ));
            }
            auto.push(op);
        }
    }
    let uniqify = obj
        .get("uniqify")
        .map(|u| parse_uniqify(u, datatype, unique, &child(path, "uniqify")))
        .transpose()?;
    Ok(MergeSpec { auto, uniqify })
}

fn parse_uniqify(
    body: &Json,
    datatype: DataType,
    unique: bool,
    path: &str,
) -> Result<UniquifyPolicy, SchemaError> {
    let obj = object(body, path)?;
    members(obj, path, &["which", "op"], &["addend", "length", "alphabet"])?;
    if !unique {
        return Err(SchemaError::at(path, SchemaErrorKind::UniquifyWithoutUnique));
    }
    let which_name = req_str(obj, "which", path)?;
    let which = match which_name {
        "last_modified" => UniquifyWhich::LastModified,
        "last_created" => UniquifyWhich::LastCreated,
        "least_impact" => UniquifyWhich::LeastImpact,
        other => {
            return Err(SchemaError::at(
                &child(path, "which"),
                SchemaErrorKind::UnknownOperator(other.to_owned()),
            ))
        }
    };
    let op_name = req_str(obj, "op", path)?;
    let op_path = child(path, "op");
    let (op, needs, params): (UniquifyOp, DataType, &[&str]) = match op_name {
        "add" => {
            let addend = opt_int(obj, "addend", path)?.unwrap_or(1);
            if addend == 0 {
                return Err(SchemaError::at(
                    &child(path, "addend"),
                    SchemaErrorKind::InvalidParameter("addend"),
                ));
            }
            (UniquifyOp::Add { addend }, DataType::Int, &["addend"])
        }
        "inc_digits_end" => (UniquifyOp::IncDigitsEnd, DataType::String, &[]),
        "gen_random_unique" | "gen_userprefix_unique" => {
            let length = opt_usize(obj, "length", path)?;
            let alphabet = opt_str(obj, "alphabet", path)?.map(str::to_owned);
            (
                UniquifyOp::Generate(generator(op_name, length, alphabet, path)?),
                DataType::String,
                &["length", "alphabet"],
            )
        }
        other => {
            return Err(SchemaError::at(
                &op_path,
                SchemaErrorKind::UnknownOperator(other.to_owned()),
            ))
        }
    };
    if needs != datatype {
        return Err(SchemaError::at(
            &op_path,
            SchemaErrorKind::OperatorNotApplicable {
                op: op_name.to_owned(),
                datatype,
            },
        ));
    }
    for key in ["addend", "length", "alphabet"] {
        if obj.contains_key(key) && !params.contains(&key) {
            return Err(SchemaError::at(
                path,
                SchemaErrorKind::UnknownMember(key.to_owned()),
            ));
        }
    }
    Ok(UniquifyPolicy { which, op })
}

fn parse_linktype(
    name: &str,
    body: &Json,
    path: &str,
    rectypes: &BTreeMap<String, Rectype>,
) -> Result<LinkType, SchemaError> {
    let obj = object(body, path)?;
    members(obj, path, &["from", "to"], &[])?;
    Ok(LinkType {
        name: name.to_owned(),
        from: parse_side(member(obj, "from", path)?, &child(path, "from"), name, rectypes)?,
        to: parse_side(member(obj, "to", path)?, &child(path, "to"), name, rectypes)?,
    })
}

fn parse_side(
    body: &Json,
    path: &str,
    link_name: &str,
    rectypes: &BTreeMap<String, Rectype>,
) -> Result<LinkSide, SchemaError> {
    let obj = object(body, path)?;
    members(obj, path, &["link_rectypes"], &["name", "singular", "required"])?;
    let list_path = child(path, "link_rectypes");
    let names = member(obj, "link_rectypes", path)?
        .as_array()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| {
            SchemaError::at(
                &list_path,
                SchemaErrorKind::WrongType("non-empty array of rectype names"),
            )
        })?;
    let side_name = opt_str(obj, "name", path)?;
    if let Some(n) = side_name {
        check_name(n, &child(path, "name"))?;
    }
    let effective = side_name.unwrap_or(link_name);

    let mut link_rectypes = BTreeSet::new();
    for entry in names {
        let rt_name = entry
            .as_str()
            .ok_or_else(|| SchemaError::at(&list_path, SchemaErrorKind::WrongType("string")))?;
        let rt = rectypes.get(rt_name).ok_or_else(|| {
            SchemaError::at(&list_path, SchemaErrorKind::UnknownRectype(rt_name.to_owned()))
        })?;
        if rt.fields.contains_key(effective) {
            return Err(SchemaError::at(
                path,
                SchemaErrorKind::NameCollision(effective.to_owned()),
            ));
        }
        if !link_rectypes.insert(rt_name.to_owned()) {
            return Err(SchemaError::at(
                &list_path,
                SchemaErrorKind::DuplicateValue(rt_name.to_owned()),
            ));
        }
    }
    Ok(LinkSide {
        link_rectypes,
        name: side_name.map(str::to_owned),
        singular: opt_bool(obj, "singular", path)?.unwrap_or(false),
        required: opt_bool(obj, "required", path)?.unwrap_or(false),
    })
}

fn check_calculations(
    rectypes: &BTreeMap<String, Rectype>,
    linktypes: &BTreeMap<String, LinkType>,
) -> Result<(), SchemaError> {
    for rt in rectypes.values() {
        for (fname, spec) in &rt.fields {
            let Some(calc) = &spec.calculated else {
                continue;
            };
            let path = format!("$.rectypes.{}.fields.{fname}.calculated", rt.name);
            let invalid = |msg: String| SchemaError::at(&path, SchemaErrorKind::InvalidCalculation(msg));
            let lt = linktypes.get(&calc.depends_on).ok_or_else(|| {
                SchemaError::at(&path, SchemaErrorKind::UnknownLink(calc.depends_on.clone()))
            })?;
            if !lt.to.link_rectypes.contains(&rt.name) {
                return Err(invalid(format!(
                    "`{}` is not on the to side of `{}`",
                    rt.name, lt.name
                )));
            }
            let Some(from_field) = &calc.field_from else {
                continue;
            };
            for from_rt in &lt.from.link_rectypes {
                let source = rectypes
                    .get(from_rt)
                    .and_then(|r| r.fields.get(from_field))
                    .ok_or_else(|| invalid(format!("`{from_rt}` has no field `{from_field}`")))?;
                if !source.datatype.is_ordered_number() {
                    return Err(invalid(format!("`{from_rt}.{from_field}` is not numeric")));
                }
            }
        }
    }
    Ok(())
}

type Node = (String, String);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

fn check_cycles(
    rectypes: &BTreeMap<String, Rectype>,
    linktypes: &BTreeMap<String, LinkType>,
) -> Result<(), SchemaError> {
    let mut edges: BTreeMap<Node, Vec<Node>> = BTreeMap::new();
    for rt in rectypes.values() {
        for (fname, spec) in &rt.fields {
            let Some(calc) = &spec.calculated else {
                continue;
            };
            let targets = edges.entry((rt.name.clone(), fname.clone())).or_default();
            let (Some(lt), Some(from_field)) = (linktypes.get(&calc.depends_on), &calc.field_from)
            else {
                continue;
            };
            for from_rt in &lt.from.link_rectypes {
                let is_calculated = rectypes
                    .get(from_rt)
                    .and_then(|r| r.fields.get(from_field))
                    .is_some_and(|f| f.calculated.is_some());
                if is_calculated {
                    targets.push((from_rt.clone(), from_field.clone()));
                }
            }
        }
    }

    let mut marks: BTreeMap<Node, Mark> = BTreeMap::new();
    let mut stack = Vec::new();
    for node in edges.keys() {
        visit(node, &edges, &mut marks, &mut stack)?;
    }
    Ok(())
}

fn visit(
    node: &Node,
    edges: &BTreeMap<Node, Vec<Node>>,
    marks: &mut BTreeMap<Node, Mark>,
    stack: &mut Vec<Node>,
) -> Result<(), SchemaError> {
    match marks.get(node) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|n| n == node).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..]
                .iter()
                .map(|(r, f)| format!("{r}.{f}"))
                .collect();
            cycle.push(format!("{}.{}", node.0, node.1));
            return Err(SchemaError::at(
                &format!("$.rectypes.{}.fields.{}.calculated", node.0, node.1),
                SchemaErrorKind::DependencyCycle(cycle.join(" -> ")),
            ));
        }
        None => {}
    }
    marks.insert(node.clone(), Mark::Visiting);
    stack.push(node.clone());
    for next in edges.get(node).into_iter().flatten() {
        visit(next, edges, marks, stack)?;
    }
    stack.pop();
    marks.insert(node.clone(), Mark::Done);
    Ok(())
}

/// Rebuilds objects with keys inserted in sorted order so the serialized form
/// is key-sorted whatever map backs `serde_json::Map`.
fn canonicalize(value: &Json) -> Json {
    match value {
        Json::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                if let Some(v) = obj.get(key) {
                    out.insert(key.clone(), canonicalize(v));
                }
            }
            Json::Object(out)
        }
        Json::Array(items) => Json::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn check_name(name: &str, path: &str) -> Result<(), SchemaError> {
    if is_reserved(name) {
        return Err(SchemaError::at(
            path,
            SchemaErrorKind::ReservedName(name.to_owned()),
        ));
    }
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !head_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SchemaError::at(
            path,
            SchemaErrorKind::InvalidName(name.to_owned()),
        ));
    }
    Ok(())
}

fn child(path: &str, key: &str) -> String {
    format!("{path}.{key}")
}

fn object<'a>(value: &'a Json, path: &str) -> Result<&'a Map<String, Json>, SchemaError> {
    value
        .as_object()
        .ok_or_else(|| SchemaError::at(path, SchemaErrorKind::WrongType("object")))
}

fn member<'a>(obj: &'a Map<String, Json>, key: &str, path: &str) -> Result<&'a Json, SchemaError> {
    obj.get(key)
        .ok_or_else(|| SchemaError::at(path, SchemaErrorKind::MissingMember(key.to_owned())))
}

fn members(
    obj: &Map<String, Json>,
    path: &str,
    required: &[&str],
    optional: &[&str],
) -> Result<(), SchemaError> {
    for key in required {
        member(obj, key, path)?;
    }
    for key in obj.keys() {
        if !required.contains(&key.as_str()) && !optional.contains(&key.as_str()) {
            return Err(SchemaError::at(
                path,
                SchemaErrorKind::UnknownMember(key.clone()),
            ));
        }
    }
    Ok(())
}

fn req_str<'a>(obj: &'a Map<String, Json>, key: &str, path: &str) -> Result<&'a str, SchemaError> {
    member(obj, key, path)?
        .as_str()
        .ok_or_else(|| SchemaError::at(&child(path, key), SchemaErrorKind::WrongType("string")))
}

fn opt_str<'a>(
    obj: &'a Map<String, Json>,
    key: &str,
    path: &str,
) -> Result<Option<&'a str>, SchemaError> {
    obj.get(key)
        .map(|v| {
            v.as_str().ok_or_else(|| {
                SchemaError::at(&child(path, key), SchemaErrorKind::WrongType("string"))
            })
        })
        .transpose()
}

fn opt_bool(obj: &Map<String, Json>, key: &str, path: &str) -> Result<Option<bool>, SchemaError> {
    obj.get(key)
        .map(|v| {
            v.as_bool().ok_or_else(|| {
                SchemaError::at(&child(path, key), SchemaErrorKind::WrongType("boolean"))
            })
        })
        .transpose()
}

fn opt_int(obj: &Map<String, Json>, key: &str, path: &str) -> Result<Option<i64>, SchemaError> {
    obj.get(key)
        .map(|v| {
            v.as_i64().ok_or_else(|| {
                SchemaError::at(&child(path, key), SchemaErrorKind::WrongType("integer"))
            })
        })
        .transpose()
}

fn opt_usize(obj: &Map<String, Json>, key: &str, path: &str) -> Result<Option<usize>, SchemaError> {
    obj.get(key)
        .map(|v| {
            v.as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| {
                    SchemaError::at(
                        &child(path, key),
                        SchemaErrorKind::WrongType("non-negative integer"),
                    )
                })
        })
        .transpose()
}

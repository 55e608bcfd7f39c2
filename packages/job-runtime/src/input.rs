//! Typed input schemas and binding.
//!
//! A job declares an ordered set of parameters over a small closed type set
//! (string, integer, boolean, date, enum). Binding turns caller-provided
//! values into an [`InputSnapshot`]: the exact parameter set a run executes
//! with, persisted on the run record so re-runs reproduce intent. Binding
//! failures are [`ErrorKind::InvalidInput`] and happen before any side
//! effect.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::JobError;

/// Semantic parameter types. Anything richer is a free-form string the
/// handler parses itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    String,
    Integer,
    Boolean,
    Date,
    Enum(Vec<String>),
}

impl ParamType {
    pub fn name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Date => "date",
            ParamType::Enum(_) => "enum",
        }
    }
}

/// One declared parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub required: bool,
    /// Default in textual form, parsed against `ty` when applied.
    pub default: Option<String>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, ty: ParamType, default: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: Some(default.into()),
        }
    }
}

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Date(NaiveDate),
    Enum(String),
}

impl ParamValue {
    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::String(s) => Value::String(s.clone()),
            ParamValue::Integer(i) => Value::Number((*i).into()),
            ParamValue::Boolean(b) => Value::Bool(*b),
            ParamValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            ParamValue::Enum(s) => Value::String(s.clone()),
        }
    }

    /// Canonical textual form, used for hashing and display.
    pub fn canonical(&self) -> String {
        match self {
            ParamValue::String(s) | ParamValue::Enum(s) => s.clone(),
            ParamValue::Integer(i) => i.to_string(),
            ParamValue::Boolean(b) => b.to_string(),
            ParamValue::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) | ParamValue::Enum(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            ParamValue::Date(d) => Some(*d),
            _ => None,
        }
    }
}

/// The bound inputs a run executes with. Ordered by parameter name so the
/// hash and the JSON form are stable.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputSnapshot {
    values: BTreeMap<String, ParamValue>,
}

impl InputSnapshot {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    /// JSON object form persisted on the run record.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Stable hash over the canonical form, for singleton keys.
    pub fn stable_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.values {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.canonical().as_bytes());
            hasher.update(b"\n");
        }
        let digest = hasher.finalize();
        // First 16 bytes are plenty for a lease key component.
        digest[..16].iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Ordered parameter declarations for one job.
#[derive(Debug, Clone, Default)]
pub struct InputSchema {
    params: Vec<ParamSpec>,
}

impl InputSchema {
    pub fn new(params: Vec<ParamSpec>) -> Self {
        Self { params }
    }

    pub fn empty() -> Self {
        Self { params: Vec::new() }
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Duplicate parameter names make the whole definition invalid.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for p in &self.params {
            if p.name.trim().is_empty() {
                return Err("parameter with empty name".to_string());
            }
            if !seen.insert(p.name.as_str()) {
                return Err(format!("duplicate parameter name: {}", p.name));
            }
            if let Some(default) = &p.default {
                parse_value(&p.ty, &Value::String(default.clone()))
                    .map_err(|e| format!("default for {} does not parse: {e}", p.name))?;
            }
            if let ParamType::Enum(variants) = &p.ty {
                if variants.is_empty() {
                    return Err(format!("enum parameter {} has no variants", p.name));
                }
            }
        }
        Ok(())
    }

    /// Bind provided values (a JSON object) against the schema.
    ///
    /// Missing optional parameters take their defaults; missing required
    /// parameters and unparsable values are `invalid_input`. Unknown keys are
    /// rejected so typos surface instead of silently binding nothing.
    pub fn bind(&self, provided: &Value) -> Result<InputSnapshot, JobError> {
        let empty = serde_json::Map::new();
        let map = match provided {
            Value::Null => &empty,
            Value::Object(map) => map,
            other => {
                return Err(JobError::invalid_input(format!(
                    "inputs must be an object, got {other}"
                )))
            }
        };

        for key in map.keys() {
            if !self.params.iter().any(|p| &p.name == key) {
                return Err(JobError::invalid_input(format!("unknown parameter: {key}")));
            }
        }

        let mut values = BTreeMap::new();
        for spec in &self.params {
            match map.get(&spec.name) {
                Some(raw) => {
                    let value = parse_value(&spec.ty, raw).map_err(|e| {
                        JobError::invalid_input(format!("parameter {}: {e}", spec.name))
                    })?;
                    values.insert(spec.name.clone(), value);
                }
                None => {
                    if let Some(default) = &spec.default {
                        let value = parse_value(&spec.ty, &Value::String(default.clone()))
                            .map_err(|e| {
                                JobError::invalid_input(format!(
                                    "default for {}: {e}",
                                    spec.name
                                ))
                            })?;
                        values.insert(spec.name.clone(), value);
                    } else if spec.required {
                        return Err(JobError::invalid_input(format!(
                            "missing required parameter: {}",
                            spec.name
                        )));
                    }
                }
            }
        }

        Ok(InputSnapshot { values })
    }

    /// Bind CLI-style `key=value` string pairs.
    pub fn bind_strings(
        &self,
        provided: &BTreeMap<String, String>,
    ) -> Result<InputSnapshot, JobError> {
        let object = Value::Object(
            provided
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        );
        self.bind(&object)
    }
}

fn parse_value(ty: &ParamType, raw: &Value) -> Result<ParamValue, String> {
    match ty {
        ParamType::String => match raw {
            Value::String(s) => Ok(ParamValue::String(s.clone())),
            other => Ok(ParamValue::String(other.to_string())),
        },
        ParamType::Integer => match raw {
            Value::Number(n) => n
                .as_i64()
                .map(ParamValue::Integer)
                .ok_or_else(|| format!("{n} is not an integer")),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(ParamValue::Integer)
                .map_err(|_| format!("{s:?} is not an integer")),
            other => Err(format!("{other} is not an integer")),
        },
        ParamType::Boolean => match raw {
            Value::Bool(b) => Ok(ParamValue::Boolean(*b)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(ParamValue::Boolean(true)),
                "false" | "0" | "no" => Ok(ParamValue::Boolean(false)),
                _ => Err(format!("{s:?} is not a boolean")),
            },
            other => Err(format!("{other} is not a boolean")),
        },
        ParamType::Date => match raw {
            Value::String(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(ParamValue::Date)
                .map_err(|_| format!("{s:?} is not a YYYY-MM-DD date")),
            other => Err(format!("{other} is not a date")),
        },
        ParamType::Enum(variants) => match raw {
            Value::String(s) => {
                if variants.iter().any(|v| v == s) {
                    Ok(ParamValue::Enum(s.clone()))
                } else {
                    Err(format!(
                        "{s:?} is not one of [{}]",
                        variants.join(", ")
                    ))
                }
            }
            other => Err(format!("{other} is not an enum value")),
        },
    }
}

//! Query parameter values and their binding rules.
//!
//! [`Param`] is the value model callers hand to the executor. Before binding,
//! every parameter sequence passes through two total functions:
//! [`detect_types`] derives the mysql type string when the caller did not
//! supply one, and [`preprocess`] lowers each value into the [`BindValue`]
//! form the driver binds.

use crate::driver::BindValue;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Param {
    /// NULL value
    Null,
    /// Boolean value, bound as integer 0/1
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// Composite value, bound as its canonical JSON text
    Json(JsonValue),
}

impl Param {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }

    /// The mysql bind type character for this value.
    ///
    /// Nulls and strings bind as `s`, booleans and integers as `i`, floats as
    /// `d`, binary data as `b`. Composite values bind as their JSON text,
    /// hence `s`.
    pub fn type_char(&self) -> char {
        match self {
            Self::Null => 's',
            Self::Bool(_) => 'i',
            Self::Int(_) => 'i',
            Self::Float(_) => 'd',
            Self::String(_) => 's',
            Self::Bytes(_) => 'b',
            Self::Json(_) => 's',
        }
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Param {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<JsonValue> for Param {
    fn from(v: JsonValue) -> Self {
        Self::Json(v)
    }
}

impl<T> From<Option<T>> for Param
where
    T: Into<Param>,
{
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Derive the mysql type string for a parameter sequence.
///
/// Total over all values; the result always has exactly one character per
/// parameter.
pub fn detect_types(params: &[Param]) -> String {
    params.iter().map(Param::type_char).collect()
}

/// Lower parameters into the values the driver binds.
///
/// Total, and length-preserving: booleans become 0/1 integers, composite
/// values become their canonical JSON text (string columns receive the JSON
/// literally), everything else passes through.
pub fn preprocess(params: &[Param]) -> Vec<BindValue> {
    params
        .iter()
        .map(|param| match param {
            Param::Null => BindValue::Null,
            Param::Bool(v) => BindValue::Int(i64::from(*v)),
            Param::Int(v) => BindValue::Int(*v),
            Param::Float(v) => BindValue::Double(*v),
            Param::String(v) => BindValue::Text(v.clone()),
            Param::Bytes(v) => BindValue::Blob(v.clone()),
            Param::Json(v) => BindValue::Text(v.to_string()),
        })
        .collect()
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

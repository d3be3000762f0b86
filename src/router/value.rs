//! Typed parameter values and the conversions that produce them.
//!
//! Route placeholders, query validators and body validators all declare a
//! [`ParamType`]; [`convert`] turns the raw text captured for a parameter
//! into a [`Value`] of that type.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;

use crate::error::HttpError;

/// The closed set of parameter types.
///
/// Route templates accept the tags `int`, `str`, `float`, `list`,
/// `list[int]`, `list[float]`, `list[str]` and `dict`. `Date` and `DateTime`
/// are only available to validators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Float,
    Str,
    List(Box<ParamType>),
    /// Comma-separated `key=value` pairs with string values.
    Dict,
    /// ISO-8601 calendar date (`YYYY-MM-DD`).
    Date,
    /// ISO-8601 date and time, with or without an offset.
    DateTime,
}

impl ParamType {
    /// Resolves a route template type tag.
    pub fn from_route_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "int" => Self::Int,
            "str" => Self::Str,
            "float" => Self::Float,
            "list" | "list[str]" => Self::List(Box::new(Self::Str)),
            "list[int]" => Self::List(Box::new(Self::Int)),
            "list[float]" => Self::List(Box::new(Self::Float)),
            "dict" => Self::Dict,
            _ => return None,
        })
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::Str => f.write_str("str"),
            Self::List(inner) => write!(f, "list[{inner}]"),
            Self::Dict => f.write_str("dict"),
            Self::Date => f.write_str("date"),
            Self::DateTime => f.write_str("datetime"),
        }
    }
}

/// A converted parameter value.
///
/// Serializes as the plain JSON value (numbers, strings, arrays, objects;
/// dates as ISO strings) so handlers can echo parameters back directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Dict(BTreeMap<String, String>),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    /// An undeclared JSON body field, kept as sent.
    Json(serde_json::Value),
}

/// Failure to turn raw parameter text into its declared type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("cannot convert {raw:?} to {expected}")]
    Coercion { expected: ParamType, raw: String },

    #[error("malformed dict entry {token:?}: expected exactly one '='")]
    MalformedDict { token: String },
}

impl From<ParamError> for HttpError {
    fn from(err: ParamError) -> Self {
        HttpError::unprocessable_entity().with_detail(err.to_string())
    }
}

impl From<ParamError> for crate::error::Error {
    fn from(err: ParamError) -> Self {
        HttpError::from(err).into()
    }
}

/// Converts `raw` according to `ty`.
///
/// Lists split on `,` and convert element-wise; dicts split on `,` and then
/// each entry on its single `=`, trimming keys and values. Nothing silently
/// defaults: every failure is reported.
///
/// # Examples
///
/// ```
/// use tandem::router::value::{convert, ParamType, Value};
///
/// let ty = ParamType::List(Box::new(ParamType::Int));
/// assert_eq!(
///     convert(&ty, "1,2").unwrap(),
///     Value::List(vec![Value::Int(1), Value::Int(2)])
/// );
/// assert!(convert(&ParamType::Dict, "a=1,b").is_err());
/// ```
pub fn convert(ty: &ParamType, raw: &str) -> Result<Value, ParamError> {
    let coercion = || ParamError::Coercion {
        expected: ty.clone(),
        raw: raw.to_owned(),
    };

    match ty {
        ParamType::Int => raw.trim().parse().map(Value::Int).map_err(|_| coercion()),
        ParamType::Float => raw
            .trim()
            .parse()
            .map(Value::Float)
            .map_err(|_| coercion()),
        ParamType::Str => Ok(Value::Str(raw.to_owned())),
        ParamType::List(inner) => raw
            .split(',')
            .map(|item| convert(inner, item))
            .collect::<Result<_, _>>()
            .map(Value::List),
        ParamType::Dict => parse_dict(raw).map(Value::Dict),
        ParamType::Date => raw.trim().parse().map(Value::Date).map_err(|_| coercion()),
        ParamType::DateTime => parse_datetime(raw.trim())
            .map(Value::DateTime)
            .ok_or_else(coercion),
    }
}

fn parse_dict(raw: &str) -> Result<BTreeMap<String, String>, ParamError> {
    let mut dict = BTreeMap::new();
    for token in raw.split(',') {
        let mut parts = token.split('=');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(value), None) => {
                dict.insert(key.trim().to_owned(), value.trim().to_owned());
            }
            _ => {
                return Err(ParamError::MalformedDict {
                    token: token.to_owned(),
                });
            }
        }
    }
    Ok(dict)
}

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = raw.parse::<NaiveDateTime>() {
        return Some(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").ok()
}

/// Extraction of a Rust type out of a [`Value`].
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }
}

impl FromValue for BTreeMap<String, String> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Dict(d) => Some(d.clone()),
            _ => None,
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Json(json) => Some(json.clone()),
            other => serde_json::to_value(other).ok(),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::List(items) => items.iter().map(T::from_value).collect(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_tags() {
        assert_eq!(ParamType::from_route_tag("int"), Some(ParamType::Int));
        assert_eq!(
            ParamType::from_route_tag("list"),
            ParamType::from_route_tag("list[str]")
        );
        assert_eq!(ParamType::from_route_tag("date"), None);
        assert_eq!(ParamType::from_route_tag("uuid"), None);
        assert_eq!(
            ParamType::from_route_tag("list[float]").unwrap().to_string(),
            "list[float]"
        );
    }

    #[test]
    fn scalars() {
        assert_eq!(convert(&ParamType::Int, "42").unwrap(), Value::Int(42));
        assert_eq!(convert(&ParamType::Float, "3.5").unwrap(), Value::Float(3.5));
        assert_eq!(
            convert(&ParamType::Str, "ana").unwrap(),
            Value::Str("ana".into())
        );
        assert!(matches!(
            convert(&ParamType::Int, "99999999999999999999"),
            Err(ParamError::Coercion { .. })
        ));
    }

    #[test]
    fn dict_entries() {
        let value = convert(&ParamType::Dict, "a=1, b = 2").unwrap();
        let dict = BTreeMap::<String, String>::from_value(&value).unwrap();
        assert_eq!(dict["a"], "1");
        assert_eq!(dict["b"], "2");

        assert_eq!(
            convert(&ParamType::Dict, "a=1,b"),
            Err(ParamError::MalformedDict { token: "b".into() })
        );
        assert!(convert(&ParamType::Dict, "a=1=2").is_err());
    }

    #[test]
    fn dates() {
        assert_eq!(
            convert(&ParamType::Date, "2024-02-29").unwrap(),
            Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert!(convert(&ParamType::Date, "2023-02-29").is_err());

        let expected = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        for raw in ["2024-05-01T08:30:00", "2024-05-01 08:30:00", "2024-05-01T08:30:00Z"] {
            assert_eq!(
                convert(&ParamType::DateTime, raw).unwrap(),
                Value::DateTime(expected)
            );
        }
    }

    #[test]
    fn values_serialize_as_plain_json() {
        let value = Value::List(vec![Value::Int(1), Value::Str("x".into())]);
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"[1,"x"]"#);
        let date = Value::Date(NaiveDate::from_ymd_opt(1, 1, 1).unwrap());
        assert_eq!(serde_json::to_string(&date).unwrap(), r#""0001-01-01""#);
    }

    #[test]
    fn param_errors_become_422() {
        let err: HttpError = ParamError::MalformedDict { token: "b".into() }.into();
        assert_eq!(err.status().as_u16(), 422);
    }
}

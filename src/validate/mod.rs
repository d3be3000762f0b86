//! Declared parameter lists for query strings and JSON bodies.
//!
//! A [`ParamsValidator`] is an ordered list of `{name, type, message}` fields.
//! Validation converts each declared field to its [`ParamType`]; the first
//! field that is missing or fails conversion aborts with a 422 carrying that
//! field's message.

use std::collections::{BTreeMap, HashSet};

use crate::context::Params;
use crate::error::HttpError;
use crate::router::value::{ParamType, Value, convert};

#[derive(Debug, Clone)]
struct Field {
    name: String,
    ty: ParamType,
    message: String,
    required: bool,
}

/// An ordered set of typed field declarations.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeMap;
/// use tandem::router::value::ParamType;
/// use tandem::validate::ParamsValidator;
///
/// let validator = ParamsValidator::new()
///     .field("page", ParamType::Int, "page must be a number")
///     .optional("since", ParamType::Date, "since must be an ISO date");
///
/// let query = BTreeMap::from([("page".to_owned(), "3".to_owned())]);
/// let params = validator.validate(&query).unwrap();
/// assert_eq!(params.get::<i64>("page").unwrap(), 3);
///
/// let query = BTreeMap::from([("page".to_owned(), "three".to_owned())]);
/// assert_eq!(validator.validate(&query).unwrap_err().detail(), "page must be a number");
/// ```
#[derive(Debug, Clone, Default)]
pub struct ParamsValidator {
    fields: Vec<Field>,
}

impl ParamsValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a required field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, ty: ParamType, message: impl Into<String>) -> Self {
        self.fields.push(Field {
            name: name.into(),
            ty,
            message: message.into(),
            required: true,
        });
        self
    }

    /// Declares a field that may be absent (or `null` in a JSON body).
    #[must_use]
    pub fn optional(
        mut self,
        name: impl Into<String>,
        ty: ParamType,
        message: impl Into<String>,
    ) -> Self {
        self.fields.push(Field {
            name: name.into(),
            ty,
            message: message.into(),
            required: false,
        });
        self
    }

    /// Coerces a flat string map, such as a parsed query string.
    ///
    /// Undeclared keys are kept as strings.
    pub fn validate(&self, raw: &BTreeMap<String, String>) -> Result<Params, HttpError> {
        let declared: HashSet<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        let mut params = Params::new();
        for (key, value) in raw {
            if !declared.contains(key.as_str()) {
                params.insert(key.clone(), Value::Str(value.clone()));
            }
        }

        for field in &self.fields {
            match raw.get(&field.name) {
                Some(text) => {
                    let value = convert(&field.ty, text).map_err(|_| field.reject())?;
                    params.insert(field.name.clone(), value);
                }
                None if field.required => return Err(field.reject()),
                None => {}
            }
        }
        Ok(params)
    }

    /// Coerces the declared fields of a JSON object. Undeclared keys are kept
    /// as their raw JSON value.
    pub fn validate_json(
        &self,
        object: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Params, HttpError> {
        let declared: HashSet<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        let mut params = Params::new();
        for (key, value) in object {
            if !declared.contains(key.as_str()) {
                params.insert(key.clone(), Value::Json(value.clone()));
            }
        }

        for field in &self.fields {
            match object.get(&field.name) {
                None | Some(serde_json::Value::Null) if !field.required => {}
                None | Some(serde_json::Value::Null) => return Err(field.reject()),
                Some(json) => {
                    let value = from_json(&field.ty, json).ok_or_else(|| field.reject())?;
                    params.insert(field.name.clone(), value);
                }
            }
        }
        Ok(params)
    }
}

impl Field {
    fn reject(&self) -> HttpError {
        HttpError::unprocessable_entity().with_detail(self.message.clone())
    }
}

fn from_json(ty: &ParamType, json: &serde_json::Value) -> Option<Value> {
    use serde_json::Value as Json;

    match (ty, json) {
        (_, Json::String(text)) if !matches!(ty, ParamType::Str) => convert(ty, text).ok(),
        (ParamType::Str, Json::String(text)) => Some(Value::Str(text.clone())),
        (ParamType::Str, Json::Number(n)) => Some(Value::Str(n.to_string())),
        (ParamType::Int, Json::Number(n)) => n.as_i64().map(Value::Int),
        (ParamType::Float, Json::Number(n)) => n.as_f64().map(Value::Float),
        (ParamType::List(inner), Json::Array(items)) => items
            .iter()
            .map(|item| from_json(inner, item))
            .collect::<Option<_>>()
            .map(Value::List),
        (ParamType::Dict, Json::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    Json::String(s) => s.clone(),
                    Json::Number(n) => n.to_string(),
                    Json::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((k.clone(), text))
            })
            .collect::<Option<_>>()
            .map(Value::Dict),
        _ => None,
    }
}

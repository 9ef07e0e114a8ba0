// crates/client/src/codec.rs
//! Parameter bag normalization.
//!
//! Job parameters travel as a single-level bag: every value is a string,
//! number, bool or null. Nested objects and arrays are carried as their JSON
//! text. A [`Payload`] is always in that normalized form.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::CodecError;

/// Normalize a single value: structured values become JSON text, scalars
/// pass through untouched.
pub fn encode_value(value: Value) -> Value {
    match value {
        Value::Object(_) | Value::Array(_) => Value::String(value.to_string()),
        scalar => scalar,
    }
}

/// Normalize every value of a bag. Applying this twice equals applying it once.
pub fn encode_params(params: Map<String, Value>) -> Map<String, Value> {
    params
        .into_iter()
        .map(|(key, value)| (key, encode_value(value)))
        .collect()
}

/// Interpret a command-line parameter value: JSON when it parses, otherwise
/// the raw text.
pub fn parse_param_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// A normalized parameter bag ready to be sent to an endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(params: Map<String, Value>) -> Self {
        Self(encode_params(params))
    }

    /// Serialize any `Serialize` value into a payload.
    ///
    /// Fails when the value does not serialize to a JSON object.
    pub fn from_serializable<T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self::from_map(map)),
            other => Err(CodecError::NotAnObject {
                kind: value_kind(&other),
            }),
        }
    }

    /// Insert one parameter, normalizing it on the way in.
    pub fn insert<T: Serialize + ?Sized>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<&mut Self, CodecError> {
        let value = serde_json::to_value(value)?;
        self.0.insert(key.into(), encode_value(value));
        Ok(self)
    }

    /// Insert binary content (an image, an audio clip) as a base64 data URL.
    pub fn insert_binary(
        &mut self,
        key: impl Into<String>,
        mime: &str,
        bytes: &[u8],
    ) -> &mut Self {
        let data_url = format!("data:{mime};base64,{}", STANDARD.encode(bytes));
        self.0.insert(key.into(), Value::String(data_url));
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(params: Map<String, Value>) -> Self {
        Self::from_map(params)
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

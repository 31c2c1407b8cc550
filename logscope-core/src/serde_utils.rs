use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::errors::{LogScopeError, Result};

/// Serializes a value to JSON, pretty-printed on request.
pub fn to_json_string<T: Serialize + ?Sized>(value: &T, pretty: bool) -> Result<String> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    rendered.map_err(|err| LogScopeError::Serialization(err.to_string()))
}

/// Deserializes a JSON string into the provided type with shared error semantics.
pub fn from_json_str<T: DeserializeOwned>(input: &str) -> Result<T> {
    serde_json::from_str(input).map_err(|err| LogScopeError::Deserialization(err.to_string()))
}

/// Parses a JSON array and keeps the elements `validate` accepts; anything
/// else in the array is dropped silently. A payload that is not an array at
/// all is an error.
pub fn parse_array_lenient<T, F>(input: &str, validate: F) -> Result<Vec<T>>
where
    F: Fn(Value) -> Option<T>,
{
    match from_json_str::<Value>(input)? {
        Value::Array(items) => Ok(items.into_iter().filter_map(validate).collect()),
        other => Err(LogScopeError::Deserialization(format!(
            "expected a JSON array, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

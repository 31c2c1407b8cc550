use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Placeholder emitted when a value refers back to one of its ancestors.
pub const CIRCULAR_SENTINEL: &str = "[Circular Reference]";
/// Placeholder emitted when an object could not be enumerated at all.
pub const UNCLONEABLE_SENTINEL: &str = "[Uncloneable Object]";

const TYPE_TAG: &str = "__type";

/// JSON-safe value tree produced by normalisation.
///
/// Special runtime types travel as tagged objects (`{"__type": "Error", ...}`)
/// and the two sentinels travel as their literal strings, so the wire form is
/// plain JSON while consumers can still match exhaustively. Object keys keep
/// their insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Value", from = "Value")]
pub enum LogValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Error {
        name: String,
        message: String,
        stack: Option<String>,
    },
    /// ISO-8601 timestamp.
    Date(String),
    /// `/source/flags` rendering of a regular expression.
    RegExp(String),
    Array(Vec<LogValue>),
    Object(IndexMap<String, LogValue>),
    Circular,
    Uncloneable,
}

impl LogValue {
    pub fn string(value: impl Into<String>) -> Self {
        LogValue::String(value.into())
    }

    /// Finite floats become numbers; NaN and the infinities keep their
    /// textual form since JSON cannot carry them.
    pub fn from_f64(value: f64) -> Self {
        match Number::from_f64(value) {
            Some(number) => LogValue::Number(number),
            None if value.is_nan() => LogValue::string("NaN"),
            None if value.is_sign_negative() => LogValue::string("-Infinity"),
            None => LogValue::string("Infinity"),
        }
    }

    /// Converts JSON verbatim, without interpreting `__type` tags or
    /// sentinel strings. Used for payloads that never went through
    /// normalisation.
    pub fn from_plain_json(value: Value) -> Self {
        match value {
            Value::Null => LogValue::Null,
            Value::Bool(value) => LogValue::Bool(value),
            Value::Number(value) => LogValue::Number(value),
            Value::String(value) => LogValue::String(value),
            Value::Array(items) => {
                LogValue::Array(items.into_iter().map(LogValue::from_plain_json).collect())
            }
            Value::Object(map) => LogValue::Object(
                map.into_iter()
                    .map(|(key, value)| (key, LogValue::from_plain_json(value)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> Value {
        Value::from(self.clone())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            LogValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&LogValue> {
        match self {
            LogValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, LogValue::Circular | LogValue::Uncloneable)
    }
}

impl From<LogValue> for Value {
    fn from(value: LogValue) -> Self {
        match value {
            LogValue::Null => Value::Null,
            LogValue::Bool(value) => Value::Bool(value),
            LogValue::Number(value) => Value::Number(value),
            LogValue::String(value) => Value::String(value),
            LogValue::Error {
                name,
                message,
                stack,
            } => {
                let mut map = Map::new();
                map.insert(TYPE_TAG.into(), Value::from("Error"));
                map.insert("name".into(), Value::from(name));
                map.insert("message".into(), Value::from(message));
                map.insert("stack".into(), stack.map(Value::from).unwrap_or(Value::Null));
                Value::Object(map)
            }
            LogValue::Date(iso) => tagged("Date", iso),
            LogValue::RegExp(pattern) => tagged("RegExp", pattern),
            LogValue::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            LogValue::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
            LogValue::Circular => Value::from(CIRCULAR_SENTINEL),
            LogValue::Uncloneable => Value::from(UNCLONEABLE_SENTINEL),
        }
    }
}

impl From<Value> for LogValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) if text == CIRCULAR_SENTINEL => LogValue::Circular,
            Value::String(text) if text == UNCLONEABLE_SENTINEL => LogValue::Uncloneable,
            Value::Array(items) => LogValue::Array(items.into_iter().map(LogValue::from).collect()),
            Value::Object(map) => match tagged_variant(&map) {
                Some(tagged) => tagged,
                None => LogValue::Object(
                    map.into_iter()
                        .map(|(key, value)| (key, LogValue::from(value)))
                        .collect(),
                ),
            },
            other => LogValue::from_plain_json(other),
        }
    }
}

fn tagged(kind: &str, value: String) -> Value {
    let mut map = Map::new();
    map.insert(TYPE_TAG.into(), Value::from(kind));
    map.insert("value".into(), Value::from(value));
    Value::Object(map)
}

/// Reads a tagged special type back. Only the exact shapes written by
/// `From<LogValue> for Value` qualify; anything else is ordinary data.
fn tagged_variant(map: &Map<String, Value>) -> Option<LogValue> {
    let text = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);

    match map.get(TYPE_TAG).and_then(Value::as_str)? {
        "Error" if map.len() == 4 => {
            let stack = match map.get("stack")? {
                Value::Null => None,
                Value::String(stack) => Some(stack.clone()),
                _ => return None,
            };
            Some(LogValue::Error {
                name: text("name")?,
                message: text("message")?,
                stack,
            })
        }
        "Date" if map.len() == 2 => text("value").map(LogValue::Date),
        "RegExp" if map.len() == 2 => text("value").map(LogValue::RegExp),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn special_types_use_tagged_objects() {
        let value = LogValue::Error {
            name: "TypeError".into(),
            message: "boom".into(),
            stack: None,
        };
        assert_eq!(
            serde_json::to_value(&value).unwrap(),
            json!({"__type": "Error", "name": "TypeError", "message": "boom", "stack": null})
        );

        let date = LogValue::Date("2024-01-01T00:00:00.000Z".into());
        assert_eq!(
            serde_json::to_value(&date).unwrap(),
            json!({"__type": "Date", "value": "2024-01-01T00:00:00.000Z"})
        );
    }

    #[test]
    fn sentinels_survive_a_wire_trip() {
        let value = LogValue::Array(vec![LogValue::Circular, LogValue::Uncloneable]);
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(text, r#"["[Circular Reference]","[Uncloneable Object]"]"#);

        let decoded: LogValue = serde_json::from_str(&text).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn non_finite_floats_become_strings() {
        assert_eq!(LogValue::from_f64(f64::NAN), LogValue::string("NaN"));
        assert_eq!(
            LogValue::from_f64(f64::NEG_INFINITY),
            LogValue::string("-Infinity")
        );
        assert!(matches!(LogValue::from_f64(1.5), LogValue::Number(_)));
    }

    #[test]
    fn plain_json_keeps_type_tags_verbatim() {
        let raw = json!({"__type": "Date", "value": "x"});
        let plain = LogValue::from_plain_json(raw.clone());
        assert!(matches!(plain, LogValue::Object(_)));
        assert_eq!(plain.get("__type"), Some(&LogValue::string("Date")));
        assert!(matches!(LogValue::from(raw), LogValue::Date(_)));
    }

    #[test]
    fn user_objects_with_a_type_key_are_not_reinterpreted() {
        let raw = json!({"__type": "Error", "name": "E", "message": "m", "code": 7});
        let decoded = LogValue::from(raw.clone());
        assert!(matches!(decoded, LogValue::Object(_)));
        assert_eq!(decoded.to_json(), raw);

        let loose_date = json!({"__type": "Date", "value": 3});
        assert!(matches!(LogValue::from(loose_date), LogValue::Object(_)));
    }

    #[test]
    fn tagged_shapes_round_trip_through_text() {
        let value = LogValue::Array(vec![
            LogValue::Error {
                name: "RangeError".into(),
                message: "out of range".into(),
                stack: Some("at f (a.js:1:1)".into()),
            },
            LogValue::RegExp("/a+/".into()),
        ]);
        let text = serde_json::to_string(&value).unwrap();
        assert_eq!(serde_json::from_str::<LogValue>(&text).unwrap(), value);
    }
}

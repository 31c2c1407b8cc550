use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A primitive tag value. Context is deliberately flat: nested structures
/// belong in `data`, not in correlation tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Number(f64),
    String(String),
}

/// Flat mapping of correlation tags, ordered by key for stable output.
pub type ContextMap = BTreeMap<String, ContextValue>;

/// Merges `overlay` on top of `base`; keys in `overlay` win.
pub fn merge_context(base: &ContextMap, overlay: &ContextMap) -> ContextMap {
    let mut merged = base.clone();
    for (key, value) in overlay {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

impl fmt::Display for ContextValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextValue::Bool(value) => write!(f, "{}", value),
            ContextValue::Number(value) if value.is_finite() && value.fract() == 0.0 => {
                write!(f, "{}", *value as i64)
            }
            ContextValue::Number(value) => write!(f, "{}", value),
            ContextValue::String(value) => f.write_str(value),
        }
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::String(value.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::String(value)
    }
}

impl From<&String> for ContextValue {
    fn from(value: &String) -> Self {
        ContextValue::String(value.clone())
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        ContextValue::Bool(value)
    }
}

impl From<f64> for ContextValue {
    fn from(value: f64) -> Self {
        ContextValue::Number(value)
    }
}

macro_rules! impl_from_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ContextValue {
                fn from(value: $ty) -> Self {
                    ContextValue::Number(value as f64)
                }
            }
        )*
    };
}

impl_from_integer!(i8, i16, i32, i64, u8, u16, u32, u64, usize, f32);

//! Deep conversion of arbitrary producer values into [`LogValue`] trees.
//!
//! [`Datum`] is the input side: a dynamically shaped value that can hold
//! shared object nodes (and therefore reference cycles), fallible getters
//! and objects whose enumeration itself fails. [`normalize`] turns any of
//! that into plain JSON-safe data and never panics or loops.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use logscope_protocol::event::LogValue;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

/// Nesting depth after which values are replaced by [`MAX_DEPTH_SENTINEL`].
pub const MAX_DEPTH: usize = 64;
pub const MAX_DEPTH_SENTINEL: &str = "[Max Depth Exceeded]";

/// Name, message and stack of an error captured as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Captures an error's type name, message and `source()` chain. The
    /// chain stands in for a stack since Rust errors carry none by default.
    pub fn from_error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        let mut chain = Vec::new();
        let mut cause = err.source();
        while let Some(inner) = cause {
            chain.push(format!("caused by: {}", inner));
            cause = inner.source();
        }

        Self {
            name: short_type_name::<E>(),
            message: err.to_string(),
            stack: if chain.is_empty() {
                None
            } else {
                Some(chain.join("\n"))
            },
        }
    }
}

fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    if full.starts_with("dyn ") || full.starts_with('&') {
        return "Error".to_string();
    }
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

type Getter = Box<dyn Fn() -> Result<Datum, String>>;
type Enumerator = Box<dyn Fn() -> Result<Vec<(String, Datum)>, String>>;

enum Field {
    Value(Datum),
    Getter(Getter),
}

enum Body {
    Fields(RefCell<Vec<(String, Field)>>),
    Enumerated(Enumerator),
}

/// A shared, identity-bearing object node.
///
/// Clones point at the same node, which is what makes cycles possible
/// (`obj.insert("self", obj.clone())`). Like any `Rc` cycle, such a graph is
/// only freed once a link is broken, e.g. with [`ObjectRef::clear`].
#[derive(Clone)]
pub struct ObjectRef(Rc<Body>);

impl ObjectRef {
    pub fn new() -> Self {
        ObjectRef(Rc::new(Body::Fields(RefCell::new(Vec::new()))))
    }

    pub fn from_fields<K, V, I>(fields: I) -> Self
    where
        K: Into<String>,
        V: Into<Datum>,
        I: IntoIterator<Item = (K, V)>,
    {
        let object = Self::new();
        for (key, value) in fields {
            object.insert(key, value);
        }
        object
    }

    /// An object whose keys are produced on demand by `enumerate`; an `Err`
    /// or panic from it makes the whole object uncloneable.
    pub fn enumerated<F>(enumerate: F) -> Self
    where
        F: Fn() -> Result<Vec<(String, Datum)>, String> + 'static,
    {
        ObjectRef(Rc::new(Body::Enumerated(Box::new(enumerate))))
    }

    /// Sets `key`, replacing an existing field in place. No-op on
    /// enumerated objects.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Datum>) {
        self.put(key.into(), Field::Value(value.into()));
    }

    /// Sets `key` to a computed property. The getter runs at normalisation
    /// time; an `Err` or panic degrades to an error sentinel for that key.
    pub fn insert_getter<F>(&self, key: impl Into<String>, getter: F)
    where
        F: Fn() -> Result<Datum, String> + 'static,
    {
        self.put(key.into(), Field::Getter(Box::new(getter)));
    }

    pub fn clear(&self) {
        if let Body::Fields(fields) = &*self.0 {
            if let Ok(mut fields) = fields.try_borrow_mut() {
                fields.clear();
            }
        }
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn put(&self, key: String, field: Field) {
        let Body::Fields(fields) = &*self.0 else {
            return;
        };
        let Ok(mut fields) = fields.try_borrow_mut() else {
            return;
        };
        match fields.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = field,
            None => fields.push((key, field)),
        }
    }

    fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }
}

impl Default for ObjectRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.identity())
    }
}

/// A producer-side value, before normalisation.
#[derive(Debug, Clone)]
pub enum Datum {
    Null,
    Undefined,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    BigInt(i128),
    Str(String),
    Symbol(Option<String>),
    Error(ErrorInfo),
    Date(DateTime<Utc>),
    Regex(Regex),
    /// Typed-array analogue.
    Bytes(Vec<u8>),
    Array(Vec<Datum>),
    Object(ObjectRef),
    /// Already-JSON data, taken verbatim.
    Json(serde_json::Value),
    /// A value whose serialisation failed; carries the failure message.
    Unserializable(String),
}

impl Datum {
    pub fn error<E: std::error::Error + ?Sized>(err: &E) -> Self {
        Datum::Error(ErrorInfo::from_error(err))
    }

    /// Captures any `Serialize` value. A failing `Serialize` impl yields
    /// the uncloneable sentinel after normalisation instead of an error.
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(json) => Datum::Json(json),
            Err(err) => Datum::Unserializable(err.to_string()),
        }
    }

    pub fn display(value: impl fmt::Display) -> Self {
        Datum::Str(value.to_string())
    }

    /// Text used when this value is supplied as a log *message*.
    pub fn to_message(&self) -> String {
        match self {
            Datum::Str(text) => text.clone(),
            Datum::Error(info) => info.message.clone(),
            Datum::Undefined => "undefined".to_string(),
            other => {
                let normalized = normalize(other);
                match normalized {
                    LogValue::String(text) => text,
                    value => serde_json::to_string(&value)
                        .unwrap_or_else(|_| logscope_protocol::event::UNCLONEABLE_SENTINEL.into()),
                }
            }
        }
    }
}

impl From<bool> for Datum {
    fn from(value: bool) -> Self {
        Datum::Bool(value)
    }
}

macro_rules! impl_from_signed {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Datum {
                fn from(value: $ty) -> Self {
                    Datum::Int(value as i64)
                }
            }
        )*
    };
}

macro_rules! impl_from_unsigned {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Datum {
                fn from(value: $ty) -> Self {
                    Datum::UInt(value as u64)
                }
            }
        )*
    };
}

impl_from_signed!(i8, i16, i32, i64, isize);
impl_from_unsigned!(u8, u16, u32, u64, usize);

impl From<i128> for Datum {
    fn from(value: i128) -> Self {
        Datum::BigInt(value)
    }
}

impl From<f32> for Datum {
    fn from(value: f32) -> Self {
        Datum::Float(value as f64)
    }
}

impl From<f64> for Datum {
    fn from(value: f64) -> Self {
        Datum::Float(value)
    }
}

impl From<&str> for Datum {
    fn from(value: &str) -> Self {
        Datum::Str(value.to_string())
    }
}

impl From<String> for Datum {
    fn from(value: String) -> Self {
        Datum::Str(value)
    }
}

impl From<&String> for Datum {
    fn from(value: &String) -> Self {
        Datum::Str(value.clone())
    }
}

impl From<serde_json::Value> for Datum {
    fn from(value: serde_json::Value) -> Self {
        Datum::Json(value)
    }
}

impl From<DateTime<Utc>> for Datum {
    fn from(value: DateTime<Utc>) -> Self {
        Datum::Date(value)
    }
}

impl From<Regex> for Datum {
    fn from(value: Regex) -> Self {
        Datum::Regex(value)
    }
}

impl From<ErrorInfo> for Datum {
    fn from(value: ErrorInfo) -> Self {
        Datum::Error(value)
    }
}

impl From<ObjectRef> for Datum {
    fn from(value: ObjectRef) -> Self {
        Datum::Object(value)
    }
}

impl<T: Into<Datum>> From<Vec<T>> for Datum {
    fn from(values: Vec<T>) -> Self {
        Datum::Array(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Datum>> From<Option<T>> for Datum {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Datum::Undefined)
    }
}

/// Normalises one value. Cycle tracking is local to this call.
pub fn normalize(value: &Datum) -> LogValue {
    let mut visited = HashSet::new();
    catch_unwind(AssertUnwindSafe(|| normalize_with(value, &mut visited, 0)))
        .unwrap_or(LogValue::Uncloneable)
}

/// Normalises each element of a `data` list independently.
pub fn normalize_all(values: &[Datum]) -> Vec<LogValue> {
    values.iter().map(normalize).collect()
}

fn normalize_with(value: &Datum, visited: &mut HashSet<usize>, depth: usize) -> LogValue {
    if depth > MAX_DEPTH {
        return LogValue::string(MAX_DEPTH_SENTINEL);
    }

    match value {
        Datum::Null | Datum::Undefined => LogValue::Null,
        Datum::Bool(value) => LogValue::Bool(*value),
        Datum::Int(value) => LogValue::Number((*value).into()),
        Datum::UInt(value) => LogValue::Number((*value).into()),
        Datum::Float(value) => LogValue::from_f64(*value),
        Datum::BigInt(value) => LogValue::String(format!("{}n", value)),
        Datum::Str(value) => LogValue::String(value.clone()),
        Datum::Symbol(description) => {
            LogValue::String(format!("Symbol({})", description.as_deref().unwrap_or("")))
        }
        Datum::Error(info) => LogValue::Error {
            name: info.name.clone(),
            message: info.message.clone(),
            stack: info.stack.clone(),
        },
        Datum::Date(at) => LogValue::Date(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        Datum::Regex(pattern) => LogValue::RegExp(format!("/{}/", pattern.as_str())),
        Datum::Bytes(bytes) => LogValue::Array(
            bytes
                .iter()
                .map(|byte| LogValue::Number((*byte).into()))
                .collect(),
        ),
        Datum::Array(items) => LogValue::Array(
            items
                .iter()
                .map(|item| normalize_with(item, visited, depth + 1))
                .collect(),
        ),
        Datum::Object(object) => normalize_object(object, visited, depth),
        Datum::Json(json) => normalize_json(json, depth),
        Datum::Unserializable(_) => LogValue::Uncloneable,
    }
}

/// Same walk as [`LogValue::from_plain_json`], under the shared depth bound.
fn normalize_json(value: &Value, depth: usize) -> LogValue {
    if depth > MAX_DEPTH {
        return LogValue::string(MAX_DEPTH_SENTINEL);
    }

    match value {
        Value::Null => LogValue::Null,
        Value::Bool(value) => LogValue::Bool(*value),
        Value::Number(value) => LogValue::Number(value.clone()),
        Value::String(value) => LogValue::String(value.clone()),
        Value::Array(items) => LogValue::Array(
            items
                .iter()
                .map(|item| normalize_json(item, depth + 1))
                .collect(),
        ),
        Value::Object(map) => LogValue::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), normalize_json(item, depth + 1)))
                .collect(),
        ),
    }
}

fn normalize_object(object: &ObjectRef, visited: &mut HashSet<usize>, depth: usize) -> LogValue {
    let identity = object.identity();
    // `visited` holds the current ancestor chain only, so an object shared by
    // two siblings is copied twice rather than reported as circular.
    if !visited.insert(identity) {
        return LogValue::Circular;
    }

    let normalized = match &*object.0 {
        Body::Fields(cell) => match cell.try_borrow() {
            Ok(fields) => {
                let mut map = IndexMap::new();
                for (key, field) in fields.iter() {
                    let value = match field {
                        Field::Value(datum) => normalize_with(datum, visited, depth + 1),
                        Field::Getter(getter) => read_getter(getter, visited, depth),
                    };
                    map.insert(key.clone(), value);
                }
                LogValue::Object(map)
            }
            Err(_) => LogValue::Uncloneable,
        },
        Body::Enumerated(enumerate) => match catch_unwind(AssertUnwindSafe(|| enumerate())) {
            Ok(Ok(entries)) => {
                let mut map = IndexMap::new();
                for (key, datum) in entries {
                    let value = normalize_with(&datum, visited, depth + 1);
                    map.insert(key, value);
                }
                LogValue::Object(map)
            }
            Ok(Err(_)) | Err(_) => LogValue::Uncloneable,
        },
    };

    visited.remove(&identity);
    normalized
}

fn read_getter(getter: &Getter, visited: &mut HashSet<usize>, depth: usize) -> LogValue {
    match catch_unwind(AssertUnwindSafe(|| getter())) {
        Ok(Ok(datum)) => normalize_with(&datum, visited, depth + 1),
        Ok(Err(message)) => property_error(&message),
        Err(payload) => property_error(&panic_message(payload.as_ref())),
    }
}

fn property_error(message: &str) -> LogValue {
    LogValue::String(format!("[Property Access Error: {}]", message))
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

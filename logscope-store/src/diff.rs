//! Structural comparison of two normalised values.

use std::collections::BTreeSet;

use logscope_protocol::event::LogValue;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Changed,
}

/// One difference, addressed by a dotted path with `[i]` array indices.
/// The root itself has the empty path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Change {
    pub path: String,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<LogValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<LogValue>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectDiff {
    pub changes: Vec<Change>,
    pub summary: DiffSummary,
}

impl ObjectDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn change_at(&self, path: &str) -> Option<&Change> {
        self.changes.iter().find(|change| change.path == path)
    }

    /// The diff as a value suitable for a log event's `data`.
    pub fn to_log_value(&self) -> LogValue {
        serde_json::to_value(self)
            .map(LogValue::from)
            .unwrap_or(LogValue::Uncloneable)
    }

    fn record(&mut self, change: Change) {
        match change.kind {
            ChangeKind::Added => self.summary.added += 1,
            ChangeKind::Removed => self.summary.removed += 1,
            ChangeKind::Changed => self.summary.changed += 1,
        }
        self.summary.total += 1;
        self.changes.push(change);
    }
}

/// Compares `before` with `after`. Objects are compared key-wise (keys in
/// sorted order), arrays index-wise; anything else is compared by value.
pub fn diff(before: &LogValue, after: &LogValue) -> ObjectDiff {
    let mut out = ObjectDiff::default();
    walk("", before, after, &mut out);
    out
}

fn walk(path: &str, before: &LogValue, after: &LogValue, out: &mut ObjectDiff) {
    match (before, after) {
        (LogValue::Object(left), LogValue::Object(right)) => {
            let keys: BTreeSet<&String> = left.keys().chain(right.keys()).collect();
            for key in keys {
                let child = join_key(path, key);
                match (left.get(key), right.get(key)) {
                    (Some(old), Some(new)) => walk(&child, old, new, out),
                    (Some(old), None) => out.record(removed(child, old)),
                    (None, Some(new)) => out.record(added(child, new)),
                    (None, None) => {}
                }
            }
        }
        (LogValue::Array(left), LogValue::Array(right)) => {
            for index in 0..left.len().max(right.len()) {
                let child = format!("{}[{}]", path, index);
                match (left.get(index), right.get(index)) {
                    (Some(old), Some(new)) => walk(&child, old, new, out),
                    (Some(old), None) => out.record(removed(child, old)),
                    (None, Some(new)) => out.record(added(child, new)),
                    (None, None) => {}
                }
            }
        }
        (old, new) if old != new => out.record(Change {
            path: path.to_string(),
            kind: ChangeKind::Changed,
            before: Some(old.clone()),
            after: Some(new.clone()),
        }),
        _ => {}
    }
}

fn join_key(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn added(path: String, value: &LogValue) -> Change {
    Change {
        path,
        kind: ChangeKind::Added,
        before: None,
        after: Some(value.clone()),
    }
}

fn removed(path: String, value: &LogValue) -> Change {
    Change {
        path,
        kind: ChangeKind::Removed,
        before: Some(value.clone()),
        after: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value(json: serde_json::Value) -> LogValue {
        LogValue::from_plain_json(json)
    }

    #[test]
    fn reports_nested_changes_by_path() {
        let before = value(json!({"user": {"name": "ana", "roles": ["a", "b"]}, "stale": 1}));
        let after = value(json!({"user": {"name": "bea", "roles": ["a"]}, "fresh": true}));

        let result = diff(&before, &after);
        assert_eq!(
            result.summary,
            DiffSummary {
                added: 1,
                removed: 2,
                changed: 1,
                total: 4
            }
        );
        assert_eq!(result.change_at("user.name").unwrap().kind, ChangeKind::Changed);
        assert_eq!(result.change_at("user.roles[1]").unwrap().kind, ChangeKind::Removed);
        assert_eq!(result.change_at("fresh").unwrap().kind, ChangeKind::Added);
        assert_eq!(result.change_at("stale").unwrap().kind, ChangeKind::Removed);
    }

    #[test]
    fn identical_values_have_no_changes() {
        let both = value(json!({"a": [1, {"b": null}]}));
        assert!(diff(&both, &both).is_empty());
    }

    #[test]
    fn type_changes_are_reported_at_the_root() {
        let result = diff(&value(json!([1])), &value(json!("one")));
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].path, "");
    }

    #[test]
    fn diff_serializes_for_logging() {
        let result = diff(&value(json!({"a": 1})), &value(json!({"a": 2})));
        let logged = serde_json::to_value(result.to_log_value()).unwrap();
        assert_eq!(logged["summary"]["changed"], json!(1));
        assert_eq!(logged["changes"][0]["path"], json!("a"));
    }
}

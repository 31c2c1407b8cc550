use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use logscope_protocol::event::{LogEvent, LogLevel};

/// Non-owning view over a store: which events a display surface shows.
/// Applying a filter never mutates the store.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
    pub levels: BTreeSet<LogLevel>,
    pub search: String,
    pub file: String,
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            levels: LogLevel::ALL.into_iter().collect(),
            search: String::new(),
            file: String::new(),
            time_range: None,
        }
    }
}

impl FilterState {
    pub fn with_levels(mut self, levels: impl IntoIterator<Item = LogLevel>) -> Self {
        self.levels = levels.into_iter().collect();
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = search.into();
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = file.into();
        self
    }

    pub fn with_time_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.time_range = Some((from, to));
        self
    }

    /// All criteria must hold. Text comparisons are case-insensitive and
    /// the time range is inclusive at both ends.
    pub fn matches(&self, event: &LogEvent) -> bool {
        if !self.levels.contains(&event.level) {
            return false;
        }
        if !self.search.is_empty() && !matches_search(event, &self.search.to_lowercase()) {
            return false;
        }
        if !self.file.is_empty()
            && !event
                .source
                .file
                .to_lowercase()
                .contains(&self.file.to_lowercase())
        {
            return false;
        }
        if let Some((from, to)) = self.time_range {
            if event.timestamp < from || event.timestamp > to {
                return false;
            }
        }
        true
    }

    pub fn apply(&self, events: &[LogEvent]) -> Vec<LogEvent> {
        events
            .iter()
            .filter(|event| self.matches(event))
            .cloned()
            .collect()
    }
}

/// `needle` must already be lowercase.
pub(crate) fn matches_search(event: &LogEvent, needle: &str) -> bool {
    event.message.to_lowercase().contains(needle)
        || event.data_text().to_lowercase().contains(needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use logscope_protocol::event::{LogValue, Source};

    fn event(level: LogLevel, message: &str, file: &str) -> LogEvent {
        let mut event = LogEvent::new(level, message, Utc::now());
        event.source = Source::new(file, 1);
        event
    }

    #[test]
    fn default_filter_matches_everything() {
        let filter = FilterState::default();
        assert!(filter.matches(&event(LogLevel::Debug, "x", "a.rs")));
    }

    #[test]
    fn search_covers_message_and_data() {
        let mut with_data = event(LogLevel::Info, "request done", "api/client.rs");
        with_data.data = vec![LogValue::string("Gateway TIMEOUT")];

        let filter = FilterState::default().with_search("timeout");
        assert!(filter.matches(&with_data));
        assert!(!filter.matches(&event(LogLevel::Info, "ok", "api/client.rs")));
    }

    #[test]
    fn criteria_compose_with_and() {
        let filter = FilterState::default()
            .with_levels([LogLevel::Error])
            .with_file("CLIENT");
        assert!(filter.matches(&event(LogLevel::Error, "x", "api/client.rs")));
        assert!(!filter.matches(&event(LogLevel::Warn, "x", "api/client.rs")));
        assert!(!filter.matches(&event(LogLevel::Error, "x", "api/server.rs")));
    }

    #[test]
    fn time_range_is_inclusive() {
        let target = event(LogLevel::Info, "x", "a.rs");
        let at = target.timestamp;
        let exact = FilterState::default().with_time_range(at, at);
        assert!(exact.matches(&target));

        let later = FilterState::default()
            .with_time_range(at + Duration::seconds(1), at + Duration::seconds(2));
        assert!(!later.matches(&target));
    }
}

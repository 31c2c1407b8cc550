//! Portable renderings of a store snapshot.

use std::collections::BTreeSet;
use std::fmt::{self, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use logscope_core::serde_utils::to_json_string;
use logscope_core::{CoreResult, LogScopeError};
use logscope_protocol::event::{LogEvent, LogLevel};
use tracing::warn;

use crate::clock::to_chrono;
use crate::filter::matches_search;

/// Returned whenever an export fails internally.
pub const EMPTY_EXPORT: &str = "[]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// JSON array of events.
    Json { pretty: bool },
    /// One human-readable block per event.
    Text,
}

impl Default for ExportFormat {
    fn default() -> Self {
        ExportFormat::Json { pretty: true }
    }
}

/// Which events to export and how. Unset criteria do not filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportOptions {
    pub format: ExportFormat,
    pub levels: Option<BTreeSet<LogLevel>>,
    pub search: Option<String>,
    /// Only events newer than `now - since`.
    pub since: Option<Duration>,
}

impl ExportOptions {
    pub fn json() -> Self {
        Self::default()
    }

    pub fn text() -> Self {
        Self {
            format: ExportFormat::Text,
            ..Self::default()
        }
    }

    pub fn compact(mut self) -> Self {
        if let ExportFormat::Json { pretty } = &mut self.format {
            *pretty = false;
        }
        self
    }

    pub fn levels(mut self, levels: impl IntoIterator<Item = LogLevel>) -> Self {
        self.levels = Some(levels.into_iter().collect());
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn since(mut self, window: Duration) -> Self {
        self.since = Some(window);
        self
    }
}

/// Renders the events selected by `options`. Never panics; any internal
/// failure yields [`EMPTY_EXPORT`].
pub fn export(logs: &[LogEvent], options: &ExportOptions, now: DateTime<Utc>) -> String {
    match catch_unwind(AssertUnwindSafe(|| try_export(logs, options, now))) {
        Ok(Ok(rendered)) => rendered,
        Ok(Err(err)) => {
            warn!(error = %err, "export failed");
            EMPTY_EXPORT.to_string()
        }
        Err(_) => {
            warn!("export panicked");
            EMPTY_EXPORT.to_string()
        }
    }
}

/// Events that pass every criterion in `options`, in store order.
pub fn select<'a>(
    logs: &'a [LogEvent],
    options: &ExportOptions,
    now: DateTime<Utc>,
) -> Vec<&'a LogEvent> {
    let cutoff = options.since.map(|window| now - to_chrono(window));
    let needle = options
        .search
        .as_deref()
        .filter(|search| !search.is_empty())
        .map(str::to_lowercase);

    logs.iter()
        .filter(|event| cutoff.map_or(true, |cutoff| event.timestamp >= cutoff))
        .filter(|event| {
            options
                .levels
                .as_ref()
                .map_or(true, |levels| levels.contains(&event.level))
        })
        .filter(|event| {
            needle
                .as_deref()
                .map_or(true, |needle| matches_search(event, needle))
        })
        .collect()
}

fn try_export(logs: &[LogEvent], options: &ExportOptions, now: DateTime<Utc>) -> CoreResult<String> {
    let selected = select(logs, options, now);
    match options.format {
        ExportFormat::Json { pretty } => to_json_string(&selected, pretty),
        ExportFormat::Text => {
            let blocks = selected
                .iter()
                .map(|event| format_text_block(event))
                .collect::<CoreResult<Vec<_>>>()?;
            Ok(blocks.join("\n"))
        }
    }
}

/// Human-readable block for one event:
///
/// ```text
/// [2024-05-01T10:00:00.000Z] WARN  payment retry
///   context: attempt=2 env=dev
///   span: 01890a5d-...
///   at: checkout/pay.rs:42:9
///   data: [...]
/// ```
pub fn format_text_block(event: &LogEvent) -> CoreResult<String> {
    let data = if event.data.is_empty() {
        None
    } else {
        Some(to_json_string(&event.data, true)?)
    };

    let mut block = String::new();
    write_text_block(&mut block, event, data.as_deref())
        .map_err(|err| LogScopeError::Serialization(err.to_string()))?;
    Ok(block)
}

fn write_text_block(out: &mut impl Write, event: &LogEvent, data: Option<&str>) -> fmt::Result {
    writeln!(
        out,
        "[{}] {:<5} {}",
        event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        event.level.as_str().to_uppercase(),
        event.message
    )?;

    if let Some(context) = event.context.as_ref().filter(|context| !context.is_empty()) {
        let pairs: Vec<String> = context
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        writeln!(out, "  context: {}", pairs.join(" "))?;
    }
    if let Some(span_id) = event.span_id {
        writeln!(out, "  span: {}", span_id)?;
    }
    writeln!(out, "  at: {}", event.source)?;
    if let Some(data) = data {
        writeln!(out, "  data: {}", data.replace('\n', "\n  "))?;
    }
    Ok(())
}

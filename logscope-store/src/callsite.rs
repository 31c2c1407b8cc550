//! Best-effort call-site resolution.
//!
//! The fast path is `#[track_caller]`: every logging entry point forwards
//! its caller's [`Location`]. Textual traces (Rust backtraces, or V8 and
//! SpiderMonkey style stacks relayed from a script host) are parsed by
//! [`resolve_trace`]. Every function here is total and falls back to
//! [`Source::unknown`].

use std::backtrace::Backtrace;
use std::panic::{catch_unwind, Location};
use std::sync::OnceLock;

use logscope_protocol::event::{Source, UNKNOWN_FILE};
use regex::Regex;

/// Frames whose symbol or path contains one of these belong to the logging
/// machinery (or the runtime) and are skipped.
pub const INTERNAL_MARKERS: &[&str] = &[
    "logscope_store::",
    "logscope::",
    "logscope-store/src/",
    "std::backtrace",
    "std::panicking",
    "core::panicking",
    "/rustc/",
    "<unknown>",
];

/// One parsed stack frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub function: Option<String>,
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

impl Frame {
    fn is_internal(&self, markers: &[&str]) -> bool {
        markers.iter().any(|marker| {
            self.file.contains(marker)
                || self
                    .function
                    .as_deref()
                    .map_or(false, |function| function.contains(marker))
        })
    }

    fn into_source(self) -> Source {
        let mut source = Source::new(normalize_path(&self.file), self.line);
        source.column = self.column;
        source.function = self.function.filter(|name| !name.is_empty());
        source
    }
}

fn v8_frame() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^at (?:(.+?) \()?(.+?):(\d+)(?::(\d+))?\)?$").expect("valid v8 frame pattern")
    })
}

fn gecko_frame() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(.*?)@(.+?):(\d+)(?::(\d+))?$").expect("valid gecko frame pattern")
    })
}

fn rust_symbol() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+: (.+)$").expect("valid rust symbol pattern"))
}

fn symbol_hash() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"::h[0-9a-f]{16}$").expect("valid symbol hash pattern"))
}

fn url_origin() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.-]*://[^/]*").expect("valid url origin pattern")
    })
}

/// Parses every recognisable frame in `trace`, top of stack first.
///
/// Three layouts are understood: `at name (file:line:col)`,
/// `name@file:line:col`, and Rust's `N: symbol` line followed by an
/// `at file:line:col` line.
pub fn parse_frames(trace: &str) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut pending_symbol: Option<String> = None;

    for raw in trace.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = rust_symbol().captures(line) {
            let symbol = symbol_hash().replace(&caps[1], "").into_owned();
            pending_symbol = Some(symbol);
            continue;
        }

        if let Some(caps) = v8_frame().captures(line) {
            let function = match (caps.get(1), pending_symbol.take()) {
                (Some(name), _) => Some(name.as_str().to_string()),
                (None, symbol) => symbol,
            };
            if let Some(frame) = build_frame(function, &caps[2], &caps[3], caps.get(4)) {
                frames.push(frame);
            }
            continue;
        }

        if let Some(caps) = gecko_frame().captures(line) {
            pending_symbol = None;
            let function = Some(caps[1].to_string()).filter(|name| !name.is_empty());
            if let Some(frame) = build_frame(function, &caps[2], &caps[3], caps.get(4)) {
                frames.push(frame);
            }
        }
    }

    frames
}

fn build_frame(
    function: Option<String>,
    file: &str,
    line: &str,
    column: Option<regex::Match<'_>>,
) -> Option<Frame> {
    Some(Frame {
        function,
        file: file.to_string(),
        line: line.parse().ok()?,
        column: column.and_then(|column| column.as_str().parse().ok()),
    })
}

/// Source of the first frame in `trace` that is not internal.
pub fn resolve_trace(trace: &str, markers: &[&str]) -> Source {
    catch_unwind(|| {
        parse_frames(trace)
            .into_iter()
            .find(|frame| !frame.is_internal(markers))
            .map(Frame::into_source)
            .unwrap_or_default()
    })
    .unwrap_or_default()
}

/// Captures the current backtrace and resolves the first external frame.
/// Slow; the logging entry points use [`resolve_location`] instead.
pub fn resolve() -> Source {
    catch_unwind(|| {
        let trace = Backtrace::force_capture().to_string();
        resolve_trace(&trace, INTERNAL_MARKERS)
    })
    .unwrap_or_default()
}

/// Source for a `#[track_caller]` location.
pub fn resolve_location(location: &Location<'_>) -> Source {
    Source::new(normalize_path(location.file()), location.line()).with_column(location.column())
}

/// Strips bundler and dev-server decorations from a path and keeps at most
/// its last two segments.
pub fn normalize_path(raw: &str) -> String {
    let mut path = raw.trim();
    for prefix in ["webpack-internal:///", "webpack:///", "file://"] {
        if let Some(rest) = path.strip_prefix(prefix) {
            path = rest;
        }
    }

    let without_origin = url_origin().replace(path, "");
    let mut path: &str = &without_origin;
    if let Some(index) = path.find(['?', '#']) {
        path = &path[..index];
    }
    let path = path.replace("/@fs/", "/");

    let segments: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();

    match segments.len() {
        0 => UNKNOWN_FILE.to_string(),
        1 => segments[0].to_string(),
        len => segments[len - 2..].join("/"),
    }
}

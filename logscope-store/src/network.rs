//! Span-per-request instrumentation for outbound HTTP calls.

use std::fmt;
use std::future::Future;
use std::panic::Location;

use logscope_protocol::context;
use logscope_protocol::event::LogLevel;
use regex::Regex;
use serde_json::{json, Map, Value};
use url::Url;

use crate::normalize::{Datum, ErrorInfo};
use crate::span::SpanHandle;
use crate::store::{EventStore, SourceHint};

/// Requests whose URL matches are passed through untracked.
#[derive(Debug, Clone)]
pub enum IgnorePattern {
    Substring(String),
    Pattern(Regex),
}

impl IgnorePattern {
    pub fn substring(text: impl Into<String>) -> Self {
        IgnorePattern::Substring(text.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(IgnorePattern::Pattern)
    }

    pub fn matches(&self, url: &str) -> bool {
        match self {
            IgnorePattern::Substring(text) => url.contains(text.as_str()),
            IgnorePattern::Pattern(pattern) => pattern.is_match(url),
        }
    }
}

/// What gets logged per request. Headers and bodies are opt-in.
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    pub log_headers: bool,
    pub log_body: bool,
    pub log_response_body: bool,
    pub ignore: Vec<IgnorePattern>,
}

impl CaptureOptions {
    pub fn headers(mut self, enabled: bool) -> Self {
        self.log_headers = enabled;
        self
    }

    pub fn body(mut self, enabled: bool) -> Self {
        self.log_body = enabled;
        self
    }

    pub fn response_body(mut self, enabled: bool) -> Self {
        self.log_response_body = enabled;
        self
    }

    pub fn ignore(mut self, pattern: IgnorePattern) -> Self {
        self.ignore.push(pattern);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_uppercase(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new("POST", url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Path component used in span names; query and fragment are dropped.
    pub fn path(&self) -> String {
        let parsed = Url::parse(&self.url).or_else(|_| {
            Url::parse("http://localhost/").and_then(|base| base.join(&self.url))
        });
        match parsed {
            Ok(url) => url.path().to_string(),
            Err(_) => self
                .url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }
}

/// Metadata a tracked call exposes about its response.
pub trait ResponseMeta {
    fn status(&self) -> u16;

    fn headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn body(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl ResponseInfo {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

impl ResponseMeta for ResponseInfo {
    fn status(&self) -> u16 {
        self.status
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.headers.clone()
    }

    fn body(&self) -> Option<String> {
        self.body.clone()
    }
}

/// Whether a status closes the span successfully.
pub fn is_success_status(status: u16) -> bool {
    (200..400).contains(&status)
}

/// Wraps outbound calls in spans named `METHOD /path`.
#[derive(Debug, Clone)]
pub struct NetworkCapture {
    store: EventStore,
    options: CaptureOptions,
}

impl NetworkCapture {
    pub fn new(store: EventStore, options: CaptureOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    pub fn is_ignored(&self, url: &str) -> bool {
        self.options.ignore.iter().any(|pattern| pattern.matches(url))
    }

    /// Runs `send` inside a request span. The span is opened before the
    /// first poll, ends on a 2xx/3xx status and fails on any other status
    /// or on a transport error. The outcome of `send` is returned as is.
    #[track_caller]
    pub fn track<F, T, E>(
        &self,
        request: RequestInfo,
        send: F,
    ) -> impl Future<Output = Result<T, E>>
    where
        F: Future<Output = Result<T, E>>,
        T: ResponseMeta,
        E: fmt::Display,
    {
        let location = Location::caller();
        let tracked = if self.is_ignored(&request.url) {
            None
        } else {
            Some(self.open(&request, location))
        };
        let capture = self.clone();

        async move {
            let started = capture.store.now();
            let outcome = send.await;
            if let Some(span) = tracked {
                let elapsed = (capture.store.now() - started).num_milliseconds().max(0);
                capture.settle(&span, &request, &outcome, elapsed, location);
            }
            outcome
        }
    }

    fn open(&self, request: &RequestInfo, location: &'static Location<'static>) -> SpanHandle {
        let name = format!("{} {}", request.method, request.path());
        let span = self.store.open_span(
            name.clone(),
            context! { "method" => request.method.as_str(), "url" => request.url.as_str() },
            None,
            SourceHint::Caller(location),
        );

        let mut data = Map::new();
        data.insert("method".into(), json!(request.method));
        data.insert("url".into(), json!(request.url));
        if self.options.log_headers {
            data.insert("headers".into(), headers_json(&request.headers));
        }
        if self.options.log_body {
            data.insert("body".into(), json!(request.body));
        }
        span.log_at(
            LogLevel::Debug,
            format!("request {}", name),
            vec![Datum::Json(Value::Object(data))],
            location,
        );
        span
    }

    fn settle<T, E>(
        &self,
        span: &SpanHandle,
        request: &RequestInfo,
        outcome: &Result<T, E>,
        elapsed_ms: i64,
        location: &'static Location<'static>,
    ) where
        T: ResponseMeta,
        E: fmt::Display,
    {
        match outcome {
            Ok(response) => {
                let status = response.status();
                let mut data = Map::new();
                data.insert("status".into(), json!(status));
                data.insert("durationMs".into(), json!(elapsed_ms));
                if self.options.log_headers {
                    data.insert("headers".into(), headers_json(&response.headers()));
                }
                if self.options.log_response_body {
                    data.insert("body".into(), json!(response.body()));
                }

                let success = is_success_status(status);
                let level = if success { LogLevel::Info } else { LogLevel::Warn };
                span.log_at(
                    level,
                    format!("response {} {} {}", status, request.method, request.path()),
                    vec![Datum::Json(Value::Object(data))],
                    location,
                );
                if success {
                    span.end();
                } else {
                    span.fail();
                }
            }
            Err(err) => {
                let info = ErrorInfo::new("NetworkError", err.to_string());
                span.log_at(
                    LogLevel::Error,
                    format!("{} {} failed: {}", request.method, request.path(), err),
                    vec![Datum::Error(info)],
                    location,
                );
                span.fail();
            }
        }
    }
}

fn headers_json(headers: &[(String, String)]) -> Value {
    let map: Map<String, Value> = headers
        .iter()
        .map(|(name, value)| (name.to_lowercase(), Value::String(value.clone())))
        .collect();
    Value::Object(map)
}

//! HTTP traffic logging.
//!
//! # Responsibilities
//! - Decide which exchanges are logged (include/exclude rules, level)
//! - Decide how much of each exchange is logged (headers, bodies)
//! - Run captured exchanges through obfuscation and formatting
//! - Hand finished records to a [`LogSink`]
//!
//! # Levels
//! - `none`: nothing
//! - `basic`: method, URI, status, duration
//! - `headers`: basic plus headers
//! - `full`: headers plus bodies
//!
//! # Response Bodies
//! - 2xx and other non-error statuses: only at `full`
//! - 401, 403, 429: never
//! - Other 4xx and 5xx: at every level above `none`
//!
//! # Design Decisions
//! - Logging never fails the request; formatting errors are only warned about
//! - Records are emitted when the response body completes, or is dropped

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::http::{Method, Request, Response, StatusCode};

use crate::config::{HttpLogLevel, HttpLoggingConfig, LoggingConfig, PathRuleConfig};
use crate::http::request::RequestIdExt;
use crate::observability::capture::{
    header_pairs, BodyOutcome, CaptureBuffer, CapturedExchange, Direction, Source, TeeBody,
};
use crate::observability::formatter::{HttpLog, JsonLogFormatter, LogFormatter};
use crate::observability::metrics;
use crate::observability::obfuscation::{self, Obfuscator};
use crate::routing::PathPattern;

/// Destination for rendered traffic records.
pub trait LogSink: Send + Sync + fmt::Debug {
    fn write(&self, source: Source, record: &str);
}

/// Writes records as `info` events on the `traffic` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, source: Source, record: &str) {
        tracing::info!(target: "traffic", source = source.as_str(), "{}", record);
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<(Source, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written so far, oldest first.
    pub fn records(&self) -> Vec<(Source, String)> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl LogSink for MemorySink {
    fn write(&self, source: Source, record: &str) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((source, record.to_string()));
    }
}

/// Path/method filter for include and exclude lists.
#[derive(Debug, Clone)]
pub struct PathRule {
    pattern: PathPattern,
    methods: Vec<Method>,
}

impl PathRule {
    pub fn from_config(config: &PathRuleConfig) -> Self {
        let methods = config
            .methods
            .iter()
            .filter_map(|m| match Method::from_bytes(m.to_ascii_uppercase().as_bytes()) {
                Ok(method) => Some(method),
                Err(_) => {
                    tracing::warn!(method = %m, pattern = %config.path_pattern, "Ignoring invalid method in logging rule");
                    None
                }
            })
            .collect();
        Self {
            pattern: PathPattern::new(config.path_pattern.clone()),
            methods,
        }
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        (self.methods.is_empty() || self.methods.contains(method)) && self.pattern.matches(path)
    }
}

/// Filters, masks, formats and writes traffic records.
#[derive(Debug)]
pub struct HttpLoggingHandler {
    enabled: bool,
    level: HttpLogLevel,
    max_body_bytes: usize,
    include: Vec<PathRule>,
    exclude: Vec<PathRule>,
    obfuscator: Arc<dyn Obfuscator>,
    formatter: Arc<dyn LogFormatter>,
    sink: Arc<dyn LogSink>,
}

impl HttpLoggingHandler {
    pub fn new(
        config: &HttpLoggingConfig,
        obfuscator: Arc<dyn Obfuscator>,
        formatter: Arc<dyn LogFormatter>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            enabled: config.enabled,
            level: config.level,
            max_body_bytes: config.max_body_bytes,
            include: config.include.iter().map(PathRule::from_config).collect(),
            exclude: config.exclude.iter().map(PathRule::from_config).collect(),
            obfuscator,
            formatter,
            sink,
        }
    }

    /// Handler with the configured obfuscator and the JSON formatter.
    pub fn from_config(config: &LoggingConfig, sink: Arc<dyn LogSink>) -> Self {
        Self::new(
            &config.http,
            obfuscation::from_config(&config.obfuscate),
            Arc::new(JsonLogFormatter::new(config.http.pretty)),
            sink,
        )
    }

    pub fn level(&self) -> HttpLogLevel {
        self.level
    }

    /// Whether an exchange for `method` and `path` is logged at all.
    pub fn should_log(&self, method: &Method, path: &str) -> bool {
        if !self.enabled || self.level == HttpLogLevel::None {
            return false;
        }
        let included =
            self.include.is_empty() || self.include.iter().any(|r| r.matches(method, path));
        included && !self.exclude.iter().any(|r| r.matches(method, path))
    }

    fn include_headers(&self) -> bool {
        self.level >= HttpLogLevel::Headers
    }

    fn include_request_body(&self) -> bool {
        self.level >= HttpLogLevel::Full
    }

    /// Whether a response with `status` has its body logged.
    pub fn include_response_body(&self, status: StatusCode) -> bool {
        if self.level == HttpLogLevel::None {
            return false;
        }
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => {
                false
            }
            s if s.is_client_error() || s.is_server_error() => true,
            _ => self.level >= HttpLogLevel::Full,
        }
    }

    /// Mask, format and write one side of an exchange.
    pub fn emit(&self, exchange: CapturedExchange, include_body: bool) {
        let source = exchange.source;
        let masked = self.obfuscator.mask_exchange(exchange);
        let log = HttpLog {
            exchange: &masked,
            include_headers: self.include_headers(),
            include_body,
        };

        match self.formatter.format(&log) {
            Ok(record) => {
                self.sink.write(source, &record);
                metrics::record_traffic_logged(source.as_str());
            }
            Err(e) => {
                tracing::warn!(error = %e, uri = %masked.uri, "Failed to format traffic record");
            }
        }
    }
}

/// Tracks one exchange from request to response completion.
#[derive(Debug)]
pub struct ExchangeRecorder {
    handler: Arc<HttpLoggingHandler>,
    source: Source,
    method: Method,
    uri: String,
    headers: Vec<(String, String)>,
    request_id: Option<String>,
    request_body: CaptureBuffer,
    started: Instant,
}

impl ExchangeRecorder {
    /// Snapshot the request and tee its body.
    pub fn begin<B>(
        handler: Arc<HttpLoggingHandler>,
        source: Source,
        req: Request<B>,
    ) -> (Self, Request<TeeBody<B>>) {
        let limit = if handler.include_request_body() {
            handler.max_body_bytes
        } else {
            0
        };
        let request_body = CaptureBuffer::new(limit);

        let recorder = Self {
            source,
            method: req.method().clone(),
            uri: req.uri().to_string(),
            headers: header_pairs(req.headers()),
            request_id: req.request_id(),
            request_body: request_body.clone(),
            started: Instant::now(),
            handler,
        };

        let req = req.map(|body| TeeBody::new(body, request_body));
        (recorder, req)
    }

    /// Tee the response body; both records are written when it ends.
    pub fn finish<B>(self, response: Response<B>) -> Response<TeeBody<B>> {
        let status = response.status();
        let response_headers = header_pairs(response.headers());
        let include_body = self.handler.include_response_body(status);
        let limit = if include_body {
            self.handler.max_body_bytes
        } else {
            0
        };
        let response_body = CaptureBuffer::new(limit);
        let buffer = response_body.clone();

        response.map(move |body| {
            TeeBody::new(body, buffer).on_complete(move |outcome| {
                if outcome != BodyOutcome::Completed {
                    tracing::debug!(uri = %self.uri, ?outcome, "Response body ended early, flushing partial capture");
                }
                self.write(status, response_headers, response_body, include_body);
            })
        })
    }

    /// The call failed before a response existed; only the request is logged.
    pub fn fail(self, error: &dyn fmt::Display) {
        tracing::debug!(uri = %self.uri, error = %error, "Exchange failed before a response");
        let include_body = self.handler.include_request_body();
        let request = self.request();
        self.handler.emit(request, include_body);
    }

    fn request(&self) -> CapturedExchange {
        let (body, body_truncated) = self.request_body.snapshot();
        CapturedExchange {
            source: self.source,
            direction: Direction::Request,
            method: self.method.clone(),
            uri: self.uri.clone(),
            status: None,
            headers: self.headers.clone(),
            body,
            body_truncated,
            elapsed: None,
            request_id: self.request_id.clone(),
        }
    }

    fn write(
        &self,
        status: StatusCode,
        headers: Vec<(String, String)>,
        body: CaptureBuffer,
        include_body: bool,
    ) {
        self.handler
            .emit(self.request(), self.handler.include_request_body());

        let (body, body_truncated) = body.snapshot();
        let response = CapturedExchange {
            source: self.source,
            direction: Direction::Response,
            method: self.method.clone(),
            uri: self.uri.clone(),
            status: Some(status),
            headers,
            body,
            body_truncated,
            elapsed: Some(self.started.elapsed()),
            request_id: self.request_id.clone(),
        };
        self.handler.emit(response, include_body);
    }
}

//! Structured rendering of captured traffic.
//!
//! Inbound and outbound traffic share one record shape, told apart by the
//! `source` field:
//!
//! ```json
//! {"source":"inbound","type":"response","method":"POST","uri":"/api/orders",
//!  "host":"shop.local","path":"/api/orders","statusCode":201,"duration":"12ms",
//!  "headers":{"content-type":["application/json"]},"body":{"id":7},
//!  "trace":{"requestId":"5b0f..."}}
//! ```

use std::fmt;

use axum::http::Uri;
use serde_json::{json, Map, Value};

use crate::observability::capture::{CapturedExchange, Direction};

/// What to render for one exchange.
#[derive(Debug, Clone, Copy)]
pub struct HttpLog<'a> {
    pub exchange: &'a CapturedExchange,
    pub include_headers: bool,
    pub include_body: bool,
}

/// Renders an [`HttpLog`] to a single log line.
pub trait LogFormatter: Send + Sync + fmt::Debug {
    fn format(&self, log: &HttpLog<'_>) -> Result<String, serde_json::Error>;
}

/// JSON records, compact by default.
#[derive(Debug, Clone, Default)]
pub struct JsonLogFormatter {
    pretty: bool,
}

impl JsonLogFormatter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    /// Build the record as a JSON value.
    pub fn to_value(&self, log: &HttpLog<'_>) -> Value {
        let exchange = log.exchange;
        let mut record = Map::new();

        record.insert("source".into(), json!(exchange.source.as_str()));
        record.insert("type".into(), json!(exchange.direction.as_str()));
        record.insert("method".into(), json!(exchange.method.as_str()));
        record.insert("uri".into(), json!(exchange.uri));

        let parsed = exchange.uri.parse::<Uri>().ok();
        let host = parsed
            .as_ref()
            .and_then(|uri| uri.host().map(str::to_string))
            .or_else(|| host_header(exchange));
        if let Some(host) = host {
            record.insert("host".into(), json!(host));
        }
        let path = parsed
            .as_ref()
            .map(|uri| uri.path().to_string())
            .unwrap_or_else(|| exchange.uri.clone());
        record.insert("path".into(), json!(path));

        if exchange.direction == Direction::Response {
            if let Some(status) = exchange.status {
                record.insert("statusCode".into(), json!(status.as_u16()));
            }
            if let Some(elapsed) = exchange.elapsed {
                record.insert("duration".into(), json!(format!("{}ms", elapsed.as_millis())));
            }
        }

        if log.include_headers {
            let mut headers = Map::new();
            for (name, value) in &exchange.headers {
                match headers.get_mut(name) {
                    Some(Value::Array(values)) => values.push(json!(value)),
                    _ => {
                        headers.insert(name.clone(), json!([value]));
                    }
                }
            }
            record.insert("headers".into(), Value::Object(headers));
        }

        if log.include_body {
            if !exchange.body.is_empty() {
                let body = serde_json::from_slice::<Value>(&exchange.body)
                    .unwrap_or_else(|_| json!(String::from_utf8_lossy(&exchange.body)));
                record.insert("body".into(), body);
            }
            // Set even when the masker dropped the body.
            if exchange.body_truncated {
                record.insert("bodyTruncated".into(), json!(true));
            }
        }

        if let Some(id) = &exchange.request_id {
            record.insert("trace".into(), json!({ "requestId": id }));
        }

        Value::Object(record)
    }
}

fn host_header(exchange: &CapturedExchange) -> Option<String> {
    exchange
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map(|(_, value)| value.clone())
}

impl LogFormatter for JsonLogFormatter {
    fn format(&self, log: &HttpLog<'_>) -> Result<String, serde_json::Error> {
        let value = self.to_value(log);
        if self.pretty {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        }
    }
}

//! Masking of sensitive values before traffic is logged.
//!
//! # Responsibilities
//! - Mask header values by name (case-insensitive)
//! - Mask query parameter values by name (case-insensitive)
//! - Mask JSON body fields addressed by dotted paths
//!
//! # Path Syntax
//! ```text
//! $.password            top-level field ("$." prefix optional)
//! user.token            nested field
//! items[*].secret       field of every element of the array `items`
//! cards[*]              every element of `cards`
//! [*].id                field of every element of a top-level array
//! ```
//!
//! # Design Decisions
//! - Every operation is a pure function of input and configuration
//! - Masking never fails the request: unparseable input passes through
//! - A truncated body is dropped when JSON paths are configured, since the
//!   prefix cannot be parsed and masked
//! - JSON is masked over [`JsonNode`], a tree independent of the parser

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use url::form_urlencoded;

use crate::config::ObfuscateConfig;
use crate::observability::capture::CapturedExchange;

/// Masks captured traffic.
pub trait Obfuscator: Send + Sync + fmt::Debug {
    fn mask_headers(&self, headers: &[(String, String)]) -> Vec<(String, String)>;

    fn mask_query_params(&self, uri: &str) -> String;

    fn mask_json_fields(&self, body: &Bytes) -> Bytes;

    /// Apply all three operations to one side of an exchange.
    fn mask_exchange(&self, mut exchange: CapturedExchange) -> CapturedExchange {
        exchange.headers = self.mask_headers(&exchange.headers);
        exchange.uri = self.mask_query_params(&exchange.uri);
        exchange.body = self.mask_json_fields(&exchange.body);
        exchange
    }
}

/// Pick the obfuscator described by configuration.
pub fn from_config(config: &ObfuscateConfig) -> Arc<dyn Obfuscator> {
    if config.enabled {
        Arc::new(DefaultObfuscator::from_config(config))
    } else {
        Arc::new(NoOpObfuscator)
    }
}

/// Leaves everything unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObfuscator;

impl Obfuscator for NoOpObfuscator {
    fn mask_headers(&self, headers: &[(String, String)]) -> Vec<(String, String)> {
        headers.to_vec()
    }

    fn mask_query_params(&self, uri: &str) -> String {
        uri.to_string()
    }

    fn mask_json_fields(&self, body: &Bytes) -> Bytes {
        body.clone()
    }
}

/// Denylist-driven masking.
#[derive(Debug, Clone)]
pub struct DefaultObfuscator {
    mask: String,
    headers: HashSet<String>,
    parameters: HashSet<String>,
    json_paths: Vec<JsonPath>,
}

impl DefaultObfuscator {
    pub fn new<H, P, J>(mask: impl Into<String>, headers: H, parameters: P, json_paths: J) -> Self
    where
        H: IntoIterator,
        H::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
        J: IntoIterator,
        J::Item: AsRef<str>,
    {
        Self {
            mask: mask.into(),
            headers: headers
                .into_iter()
                .map(|h| h.as_ref().to_ascii_lowercase())
                .collect(),
            parameters: parameters
                .into_iter()
                .map(|p| p.as_ref().to_lowercase())
                .collect(),
            json_paths: json_paths
                .into_iter()
                .filter_map(|p| JsonPath::parse(p.as_ref()))
                .collect(),
        }
    }

    pub fn from_config(config: &ObfuscateConfig) -> Self {
        Self::new(
            config.mask_value.clone(),
            &config.headers,
            &config.parameters,
            &config.json_body_fields,
        )
    }

    fn mask_pair(&self, raw_name: &str) -> String {
        let mask: String = form_urlencoded::byte_serialize(self.mask.as_bytes()).collect();
        format!("{}={}", raw_name, mask)
    }
}

impl Obfuscator for DefaultObfuscator {
    fn mask_headers(&self, headers: &[(String, String)]) -> Vec<(String, String)> {
        if self.headers.is_empty() {
            return headers.to_vec();
        }

        let mut masked_seen = HashSet::new();
        let mut out = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            let lower = name.to_ascii_lowercase();
            if self.headers.contains(&lower) {
                // One masked entry at the first position.
                if masked_seen.insert(lower) {
                    out.push((name.clone(), self.mask.clone()));
                }
            } else {
                out.push((name.clone(), value.clone()));
            }
        }
        out
    }

    fn mask_query_params(&self, uri: &str) -> String {
        if self.parameters.is_empty() {
            return uri.to_string();
        }

        let (without_fragment, fragment) = match uri.find('#') {
            Some(i) => uri.split_at(i),
            None => (uri, ""),
        };
        let (path, query) = match without_fragment.find('?') {
            Some(i) => (&without_fragment[..i], &without_fragment[i + 1..]),
            None => return uri.to_string(),
        };

        let pairs: Vec<String> = query
            .split('&')
            .map(|pair| {
                let raw_name = pair.split('=').next().unwrap_or(pair);
                let decoded = form_urlencoded::parse(raw_name.as_bytes())
                    .next()
                    .map(|(name, _)| name.to_lowercase());
                match decoded {
                    Some(name) if self.parameters.contains(&name) => self.mask_pair(raw_name),
                    _ => pair.to_string(),
                }
            })
            .collect();

        format!("{}?{}{}", path, pairs.join("&"), fragment)
    }

    fn mask_json_fields(&self, body: &Bytes) -> Bytes {
        if self.json_paths.is_empty() || body.is_empty() {
            return body.clone();
        }

        let value: serde_json::Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(_) => return body.clone(),
        };

        let mut tree = JsonNode::from(value);
        for path in &self.json_paths {
            path.apply(&mut tree, &self.mask);
        }

        match serde_json::to_vec(&serde_json::Value::from(tree)) {
            Ok(bytes) => Bytes::from(bytes),
            Err(_) => body.clone(),
        }
    }

    fn mask_exchange(&self, mut exchange: CapturedExchange) -> CapturedExchange {
        exchange.headers = self.mask_headers(&exchange.headers);
        exchange.uri = self.mask_query_params(&exchange.uri);
        exchange.body = if exchange.body_truncated && !self.json_paths.is_empty() {
            Bytes::new()
        } else {
            self.mask_json_fields(&exchange.body)
        };
        exchange
    }
}

/// Parsed JSON document.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonNode {
    /// Fields in document order.
    Object(Vec<(String, JsonNode)>),
    Array(Vec<JsonNode>),
    Scalar(Scalar),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl JsonNode {
    fn masked(mask: &str) -> Self {
        JsonNode::Scalar(Scalar::String(mask.to_string()))
    }
}

impl From<serde_json::Value> for JsonNode {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => JsonNode::Scalar(Scalar::Null),
            Value::Bool(b) => JsonNode::Scalar(Scalar::Bool(b)),
            Value::Number(n) => JsonNode::Scalar(Scalar::Number(n)),
            Value::String(s) => JsonNode::Scalar(Scalar::String(s)),
            Value::Array(items) => JsonNode::Array(items.into_iter().map(JsonNode::from).collect()),
            Value::Object(map) => JsonNode::Object(
                map.into_iter()
                    .map(|(k, v)| (k, JsonNode::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<JsonNode> for serde_json::Value {
    fn from(node: JsonNode) -> Self {
        use serde_json::Value;
        match node {
            JsonNode::Scalar(Scalar::Null) => Value::Null,
            JsonNode::Scalar(Scalar::Bool(b)) => Value::Bool(b),
            JsonNode::Scalar(Scalar::Number(n)) => Value::Number(n),
            JsonNode::Scalar(Scalar::String(s)) => Value::String(s),
            JsonNode::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            JsonNode::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Field(String),
    /// `[*]`: every element of the current array.
    Each,
}

/// Compiled JSON field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<PathSegment>,
}

impl JsonPath {
    /// Parse a path. Returns `None` for an empty path.
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.trim();
        let path = path
            .strip_prefix("$.")
            .or_else(|| path.strip_prefix('$'))
            .unwrap_or(path);

        let mut segments = Vec::new();
        for part in path.split('.').filter(|p| !p.is_empty()) {
            let mut name = part;
            let mut wildcards = 0;
            while let Some(stripped) = name.strip_suffix("[*]") {
                name = stripped;
                wildcards += 1;
            }
            if !name.is_empty() {
                segments.push(PathSegment::Field(name.to_string()));
            }
            segments.extend(std::iter::repeat(PathSegment::Each).take(wildcards));
        }

        if segments.is_empty() {
            None
        } else {
            Some(Self { segments })
        }
    }

    fn apply(&self, node: &mut JsonNode, mask: &str) {
        apply_segments(node, &self.segments, mask);
    }
}

fn apply_segments(node: &mut JsonNode, segments: &[PathSegment], mask: &str) {
    let Some((segment, rest)) = segments.split_first() else {
        return;
    };

    match (segment, node) {
        (PathSegment::Field(name), JsonNode::Object(fields)) => {
            for (key, child) in fields.iter_mut() {
                if key.as_str() != name.as_str() {
                    continue;
                }
                if rest.is_empty() {
                    *child = JsonNode::masked(mask);
                } else {
                    apply_segments(child, rest, mask);
                }
            }
        }
        (PathSegment::Each, JsonNode::Array(items)) => {
            for item in items.iter_mut() {
                if rest.is_empty() {
                    mask_element(item, mask);
                } else {
                    apply_segments(item, rest, mask);
                }
            }
        }
        // Path does not fit the document shape here.
        _ => {}
    }
}

/// Mask a terminal wildcard element.
fn mask_element(node: &mut JsonNode, mask: &str) {
    match node {
        JsonNode::Object(fields) => {
            for (_, value) in fields.iter_mut() {
                *value = JsonNode::masked(mask);
            }
        }
        JsonNode::Array(items) => {
            for item in items.iter_mut() {
                mask_element(item, mask);
            }
        }
        JsonNode::Scalar(_) => *node = JsonNode::masked(mask),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use serde_json::json;

    use crate::observability::capture::{Direction, Source};

    fn obfuscator(json_paths: &[&str]) -> DefaultObfuscator {
        DefaultObfuscator::new(
            "****",
            ["authorization", "Set-Cookie"],
            ["access_token", "Code"],
            json_paths.iter().copied(),
        )
    }

    fn mask_json(paths: &[&str], body: serde_json::Value) -> serde_json::Value {
        let masked = obfuscator(paths).mask_json_fields(&Bytes::from(body.to_string()));
        serde_json::from_slice(&masked).unwrap()
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_mask_headers() {
        let masked = obfuscator(&[]).mask_headers(&pairs(&[
            ("Authorization", "Bearer x"),
            ("X-Foo", "bar"),
        ]));
        assert_eq!(masked, pairs(&[("Authorization", "****"), ("X-Foo", "bar")]));
    }

    #[test]
    fn test_mask_headers_collapses_repeats_in_place() {
        let masked = obfuscator(&[]).mask_headers(&pairs(&[
            ("content-type", "text/html"),
            ("set-cookie", "a=1"),
            ("x-trace", "t"),
            ("set-cookie", "b=2"),
        ]));
        assert_eq!(
            masked,
            pairs(&[
                ("content-type", "text/html"),
                ("set-cookie", "****"),
                ("x-trace", "t"),
            ])
        );
    }

    #[test]
    fn test_mask_query_params() {
        let o = obfuscator(&[]);
        assert_eq!(
            o.mask_query_params("/cb?state=abc&code=xyz&code=second&ACCESS_TOKEN=t#frag"),
            "/cb?state=abc&code=****&code=****&ACCESS_TOKEN=****#frag"
        );
        // Non-matching parameters keep their original encoding.
        assert_eq!(
            o.mask_query_params("/s?q=a%20b+c&access%5Ftoken=x"),
            "/s?q=a%20b+c&access%5Ftoken=****"
        );
        assert_eq!(o.mask_query_params("/plain"), "/plain");
        assert_eq!(o.mask_query_params("/flag?code"), "/flag?code=****");
    }

    #[test]
    fn test_mask_top_level_field() {
        assert_eq!(
            mask_json(&["$.password"], json!({"password": "x", "ok": 1})),
            json!({"password": "****", "ok": 1})
        );
    }

    #[test]
    fn test_mask_array_elements_field() {
        assert_eq!(
            mask_json(
                &["$.items[*].secret"],
                json!({"items": [{"secret": "a", "id": 1}, {"secret": "b", "id": 2}]})
            ),
            json!({"items": [{"secret": "****", "id": 1}, {"secret": "****", "id": 2}]})
        );
    }

    #[test]
    fn test_terminal_wildcard() {
        assert_eq!(
            mask_json(
                &["cards[*]"],
                json!({"cards": ["4111", {"pan": "4222", "exp": "12/30"}, [1, 2]], "n": 3})
            ),
            json!({"cards": ["****", {"pan": "****", "exp": "****"}, ["****", "****"]], "n": 3})
        );
    }

    #[test]
    fn test_root_array_and_nested_objects() {
        assert_eq!(
            mask_json(&["[*].user.token"], json!([{"user": {"token": "t", "name": "n"}}, 5])),
            json!([{"user": {"token": "****", "name": "n"}}, 5])
        );
    }

    #[test]
    fn test_terminal_field_replaced_regardless_of_type() {
        assert_eq!(
            mask_json(&["$.card"], json!({"card": {"pan": "4111"}, "list": [1]})),
            json!({"card": "****", "list": [1]})
        );
    }

    #[test]
    fn test_missing_paths_are_skipped() {
        let body = json!({"a": {"b": 1}, "items": "not an array"});
        assert_eq!(mask_json(&["$.x.y", "items[*].z", "a.b.c"], body.clone()), body);
    }

    #[test]
    fn test_key_order_preserved() {
        let masked = obfuscator(&["$.b"]).mask_json_fields(&Bytes::from(r#"{"z":1,"b":"s","a":2}"#));
        assert_eq!(&masked[..], br#"{"z":1,"b":"****","a":2}"#);
    }

    #[test]
    fn test_invalid_json_passes_through() {
        let body = Bytes::from_static(b"not json");
        assert_eq!(obfuscator(&["$.password"]).mask_json_fields(&body), body);
    }

    fn truncated(body: &'static [u8]) -> CapturedExchange {
        CapturedExchange {
            source: Source::Inbound,
            direction: Direction::Request,
            method: Method::POST,
            uri: "/login".into(),
            status: None,
            headers: Vec::new(),
            body: Bytes::from_static(body),
            body_truncated: true,
            elapsed: None,
            request_id: None,
        }
    }

    #[test]
    fn test_truncated_body_is_dropped_when_fields_are_masked() {
        let masked = obfuscator(&["$.password"]).mask_exchange(truncated(br#"{"password":"hunter2","padding":"#));
        assert!(masked.body.is_empty());
        assert!(masked.body_truncated);

        // Nothing to mask, so the prefix is kept.
        let kept = obfuscator(&[]).mask_exchange(truncated(br#"{"password":"hunter2","#));
        assert_eq!(&kept.body[..], br#"{"password":"hunter2","#);
    }

    #[test]
    fn test_empty_lists_are_identity() {
        let o = DefaultObfuscator::new("****", Vec::<String>::new(), Vec::<String>::new(), Vec::<String>::new());
        let headers = pairs(&[("Authorization", "Bearer x")]);
        assert_eq!(o.mask_headers(&headers), headers);
        assert_eq!(o.mask_query_params("/a?access_token=1"), "/a?access_token=1");
        let body = Bytes::from_static(br#"{"password": "x"}"#);
        assert_eq!(o.mask_json_fields(&body), body);
    }

    #[test]
    fn test_from_config_selects_noop() {
        let config = ObfuscateConfig {
            enabled: false,
            ..Default::default()
        };
        let o = from_config(&config);
        let headers = pairs(&[("Authorization", "Bearer x")]);
        assert_eq!(o.mask_headers(&headers), headers);
        assert_eq!(
            o.mask_query_params("/a?access_token=1"),
            "/a?access_token=1"
        );

        let o = from_config(&ObfuscateConfig::default());
        assert_eq!(o.mask_headers(&headers)[0].1, "****");
    }

    #[test]
    fn test_path_parsing() {
        assert_eq!(
            JsonPath::parse("$.items[*].secret").unwrap().segments,
            vec![
                PathSegment::Field("items".into()),
                PathSegment::Each,
                PathSegment::Field("secret".into())
            ]
        );
        assert_eq!(
            JsonPath::parse("[*][*]").unwrap().segments,
            vec![PathSegment::Each, PathSegment::Each]
        );
        assert!(JsonPath::parse("$").is_none());
    }
}

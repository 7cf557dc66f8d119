//! Route matching logic.
//!
//! # Responsibilities
//! - Match request method (exact, optional)
//! - Match request path against Ant-style patterns
//! - Combine conditions with AND semantics
//!
//! # Pattern Syntax
//! - `?` matches one character within a segment
//! - `*` matches zero or more characters within a segment
//! - `**` matches zero or more whole segments
//! - `{name}` matches exactly one segment
//!
//! # Design Decisions
//! - Path matching is case-sensitive
//! - Patterns are compiled once at startup
//! - No regex to keep matching linear in practice

use axum::http::Method;

/// Trait for matching requests against conditions.
pub trait RequestMatcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, method: &Method, path: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    /// `**`
    AnyDepth,
    /// `{name}`
    Variable,
    /// Literal text with possible `*` / `?` wildcards.
    Glob(String),
}

/// A compiled Ant-style path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Compile a pattern.
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let segments = split_segments(&raw)
            .map(|s| {
                if s == "**" {
                    Segment::AnyDepth
                } else if s.len() > 2 && s.starts_with('{') && s.ends_with('}') {
                    Segment::Variable
                } else {
                    Segment::Glob(s.to_string())
                }
            })
            .collect();
        Self { raw, segments }
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns true if `path` matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        let path_segments: Vec<&str> = split_segments(path).collect();
        match_segments(&self.segments, &path_segments)
    }
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn match_segments(pattern: &[Segment], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((Segment::AnyDepth, rest)) => {
            // Try consuming zero, one, two... path segments.
            (0..=path.len()).any(|skip| match_segments(rest, &path[skip..]))
        }
        Some((segment, rest)) => match path.split_first() {
            None => false,
            Some((head, tail)) => {
                let head_matches = match segment {
                    Segment::Variable => true,
                    Segment::Glob(glob) => match_glob(glob.as_bytes(), head.as_bytes()),
                    Segment::AnyDepth => unreachable!("handled above"),
                };
                head_matches && match_segments(rest, tail)
            }
        },
    }
}

/// Wildcard match with `*` and `?` over a single segment.
fn match_glob(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            // Let the last star swallow one more character.
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// Matches an optional method and a path pattern.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    method: Option<Method>,
    pattern: PathPattern,
}

impl PatternMatcher {
    /// Match the pattern for any method.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            method: None,
            pattern: PathPattern::new(pattern),
        }
    }

    /// Match the pattern for one method only.
    pub fn with_method(method: Method, pattern: impl Into<String>) -> Self {
        Self {
            method: Some(method),
            pattern: PathPattern::new(pattern),
        }
    }
}

impl RequestMatcher for PatternMatcher {
    fn matches(&self, method: &Method, path: &str) -> bool {
        self.method.as_ref().map_or(true, |m| m == method) && self.pattern.matches(path)
    }
}

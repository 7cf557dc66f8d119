//! Ordered route rules and the construction DSL.
//!
//! # Responsibilities
//! - Build an ordered list of rules from matcher batches and modifiers
//! - Resolve a request to its effective [`RoutePolicy`]
//! - Reject DSL misuse at construction time
//!
//! # Design Decisions
//! - Declaring matchers returns a [`MatcherBatch`] handle; modifiers exist only
//!   on that handle, so a modifier always applies to the batch just declared
//!   and never to an earlier one
//! - Immutable after `build()`, shared via `Arc` without locks
//! - First match wins; unmatched requests get the default policy
//!
//! A modifier cannot be called before a matcher:
//!
//! ```compile_fail
//! use traffic_guard::routing::RouteRuleSet;
//!
//! let mut builder = RouteRuleSet::builder();
//! builder.idempotent();
//! ```

use std::ops::Range;

use axum::http::{Method, Request};
use thiserror::Error;

use crate::config::{DefaultPolicyConfig, RouteRuleConfig};
use crate::routing::matcher::{PatternMatcher, RequestMatcher};

/// Breaker name given to rules that do not name one.
pub const DEFAULT_BREAKER_NAME: &str = "default";

/// Errors raised while building a rule set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteRuleError {
    #[error("any_request() may only be declared once")]
    DuplicateAnyRequest,

    #[error("rule {index}: modifiers declared without a matcher")]
    ModifierWithoutMatcher { index: usize },

    #[error("rule {index}: any_request cannot be combined with patterns")]
    AnyRequestWithPatterns { index: usize },

    #[error("rule {index}: no patterns declared")]
    EmptyBatch { index: usize },

    #[error("invalid HTTP method '{0}'")]
    InvalidMethod(String),

    #[error("pattern '{0}' must start with '/'")]
    InvalidPattern(String),
}

/// Effective policy for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
    pub breaker_name: String,
    pub protected_by_breaker: bool,
    pub idempotent: bool,
}

impl Default for RoutePolicy {
    fn default() -> Self {
        Self {
            breaker_name: DEFAULT_BREAKER_NAME.to_string(),
            protected_by_breaker: true,
            idempotent: false,
        }
    }
}

impl From<&DefaultPolicyConfig> for RoutePolicy {
    fn from(config: &DefaultPolicyConfig) -> Self {
        Self {
            breaker_name: config.breaker_name.clone(),
            protected_by_breaker: config.protected_by_breaker,
            idempotent: config.idempotent,
        }
    }
}

/// A matcher bound to a policy.
#[derive(Debug)]
pub struct RouteRule {
    matcher: Box<dyn RequestMatcher>,
    policy: RoutePolicy,
}

impl RouteRule {
    pub fn policy(&self) -> &RoutePolicy {
        &self.policy
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.matcher.matches(method, path)
    }
}

/// Ordered route rules plus a default policy.
///
/// Idempotency is opt-in. Every new rule, and the built-in default policy,
/// starts with `idempotent: false` and breaker protection on; a route needs
/// an explicit `.idempotent()` (or `idempotent = true` in config) before it
/// requires a key.
#[derive(Debug)]
pub struct RouteRuleSet {
    rules: Vec<RouteRule>,
    default_policy: RoutePolicy,
}

impl RouteRuleSet {
    /// Start a builder with the built-in default policy.
    pub fn builder() -> RouteRuleSetBuilder {
        RouteRuleSetBuilder::new(RoutePolicy::default())
    }

    /// Start a builder with an explicit default policy.
    pub fn builder_with_default(default_policy: RoutePolicy) -> RouteRuleSetBuilder {
        RouteRuleSetBuilder::new(default_policy)
    }

    /// Build a rule set from configuration entries, in order.
    pub fn from_config(
        defaults: &DefaultPolicyConfig,
        entries: &[RouteRuleConfig],
    ) -> Result<Self, RouteRuleError> {
        let mut builder = Self::builder_with_default(RoutePolicy::from(defaults));

        for (index, entry) in entries.iter().enumerate() {
            let batch = if entry.any_request {
                if !entry.patterns.is_empty() {
                    return Err(RouteRuleError::AnyRequestWithPatterns { index });
                }
                builder.any_request()
            } else if entry.patterns.is_empty() {
                return Err(if entry.has_modifiers() {
                    RouteRuleError::ModifierWithoutMatcher { index }
                } else {
                    RouteRuleError::EmptyBatch { index }
                });
            } else {
                match &entry.method {
                    Some(method) => {
                        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                            .map_err(|_| RouteRuleError::InvalidMethod(method.clone()))?;
                        builder.method_matchers(method, &entry.patterns)
                    }
                    None => builder.request_matchers(&entry.patterns),
                }
            };

            let mut batch = batch;
            if entry.permit_all {
                batch = batch.permit_all();
            }
            if let Some(protected) = entry.protected_by_breaker {
                batch = if protected {
                    batch.protected_by_breaker()
                } else {
                    batch.unprotected()
                };
            }
            if let Some(idempotent) = entry.idempotent {
                batch = if idempotent {
                    batch.idempotent()
                } else {
                    batch.not_idempotent()
                };
            }
            if let Some(name) = &entry.breaker_name {
                batch.breaker_name(name.clone());
            }
        }

        builder.build()
    }

    /// Resolve the effective policy. First matching rule wins.
    pub fn resolve(&self, method: &Method, path: &str) -> &RoutePolicy {
        self.rules
            .iter()
            .find(|rule| rule.matches(method, path))
            .map(RouteRule::policy)
            .unwrap_or(&self.default_policy)
    }

    /// Policy for a request, resolved once and cached in its extensions.
    pub fn policy_for<B>(&self, req: &mut Request<B>) -> RoutePolicy {
        if let Some(policy) = req.extensions().get::<RoutePolicy>() {
            return policy.clone();
        }
        let policy = self.resolve(req.method(), req.uri().path()).clone();
        req.extensions_mut().insert(policy.clone());
        policy
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }
}

impl Default for RouteRuleSet {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_policy: RoutePolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
enum BatchTarget {
    Default,
    Rules(Range<usize>),
}

/// Accumulates rules in declaration order.
#[derive(Debug)]
pub struct RouteRuleSetBuilder {
    rules: Vec<RouteRule>,
    default_policy: RoutePolicy,
    any_request_declared: bool,
    error: Option<RouteRuleError>,
}

impl RouteRuleSetBuilder {
    fn new(default_policy: RoutePolicy) -> Self {
        Self {
            rules: Vec::new(),
            default_policy,
            any_request_declared: false,
            error: None,
        }
    }

    /// Modifiers on the returned batch change the default policy.
    pub fn any_request(&mut self) -> MatcherBatch<'_> {
        if self.any_request_declared {
            self.fail(RouteRuleError::DuplicateAnyRequest);
        }
        self.any_request_declared = true;
        MatcherBatch {
            builder: self,
            target: BatchTarget::Default,
        }
    }

    /// One rule per pattern, matching any method.
    pub fn request_matchers<I, S>(&mut self, patterns: I) -> MatcherBatch<'_>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.push_batch(None, patterns)
    }

    /// One rule per pattern, matching only `method`.
    pub fn method_matchers<I, S>(&mut self, method: Method, patterns: I) -> MatcherBatch<'_>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.push_batch(Some(method), patterns)
    }

    /// Finish construction.
    pub fn build(self) -> Result<RouteRuleSet, RouteRuleError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(RouteRuleSet {
            rules: self.rules,
            default_policy: self.default_policy,
        })
    }

    fn push_batch<I, S>(&mut self, method: Option<Method>, patterns: I) -> MatcherBatch<'_>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let start = self.rules.len();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if !pattern.starts_with('/') {
                self.fail(RouteRuleError::InvalidPattern(pattern.to_string()));
            }
            let matcher = match &method {
                Some(m) => PatternMatcher::with_method(m.clone(), pattern),
                None => PatternMatcher::new(pattern),
            };
            self.rules.push(RouteRule {
                matcher: Box::new(matcher),
                policy: RoutePolicy::default(),
            });
        }
        if self.rules.len() == start {
            self.fail(RouteRuleError::EmptyBatch { index: start });
        }
        let end = self.rules.len();
        MatcherBatch {
            builder: self,
            target: BatchTarget::Rules(start..end),
        }
    }

    // Keep the first error; build() reports it.
    fn fail(&mut self, err: RouteRuleError) {
        self.error.get_or_insert(err);
    }
}

/// Handle to the batch declared by the last matcher call.
#[derive(Debug)]
pub struct MatcherBatch<'a> {
    builder: &'a mut RouteRuleSetBuilder,
    target: BatchTarget,
}

impl MatcherBatch<'_> {
    /// Exempt the batch from the breaker and the idempotency cache.
    pub fn permit_all(self) -> Self {
        self.update(|p| {
            p.protected_by_breaker = false;
            p.idempotent = false;
        })
    }

    pub fn protected_by_breaker(self) -> Self {
        self.update(|p| p.protected_by_breaker = true)
    }

    pub fn unprotected(self) -> Self {
        self.update(|p| p.protected_by_breaker = false)
    }

    pub fn idempotent(self) -> Self {
        self.update(|p| p.idempotent = true)
    }

    pub fn not_idempotent(self) -> Self {
        self.update(|p| p.idempotent = false)
    }

    pub fn breaker_name(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.update(|p| p.breaker_name = name.clone())
    }

    fn update(self, f: impl Fn(&mut RoutePolicy)) -> Self {
        match &self.target {
            BatchTarget::Default => f(&mut self.builder.default_policy),
            BatchTarget::Rules(range) => {
                for rule in &mut self.builder.rules[range.clone()] {
                    f(&mut rule.policy);
                }
            }
        }
        self
    }
}

//! Rule definitions and the rule compiler.
//!
//! A [`ProxyOptions`] is an ordered mapping from regex pattern to [`RawRule`].
//! [`compile`] turns it into the immutable, order-preserving list of
//! [`CompiledRule`]s the dispatcher matches against. Compilation fails as a
//! whole on the first malformed rule.

use std::{fmt, sync::Arc, time::Duration};

use http::{HeaderName, HeaderValue};
use regex::Regex;
use tracing::debug;
use url::Url;

use crate::{
    forward::{HeaderAction, HeaderOverrides},
    upstream::{Protocol, Upstream},
};

/// Upstream timeout applied when a rule does not set one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Maps the incoming path and query onto the one resolved against the target.
pub type Rewrite = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Configuration errors. Any of them prevents the proxy from being installed.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("Invalid target: {target}: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Invalid protocol: {target}")]
    InvalidProtocol { target: String },
    #[error("Invalid port: {target}")]
    InvalidPort { target: String },
    #[error("Invalid header `{name}` for pattern `{pattern}`: {reason}")]
    InvalidHeader {
        pattern: String,
        name: String,
        reason: String,
    },
}

/// Value of a rule header before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderOverride {
    Value(String),
    Values(Vec<String>),
    /// Remove the header from the forwarded request.
    Omit,
}

impl From<&str> for HeaderOverride {
    fn from(value: &str) -> Self {
        Self::Value(value.to_string())
    }
}

impl From<String> for HeaderOverride {
    fn from(value: String) -> Self {
        Self::Value(value)
    }
}

impl From<i64> for HeaderOverride {
    fn from(value: i64) -> Self {
        Self::Value(value.to_string())
    }
}

impl From<u64> for HeaderOverride {
    fn from(value: u64) -> Self {
        Self::Value(value.to_string())
    }
}

impl From<f64> for HeaderOverride {
    fn from(value: f64) -> Self {
        Self::Value(value.to_string())
    }
}

impl<T: Into<String>> From<Vec<T>> for HeaderOverride {
    fn from(values: Vec<T>) -> Self {
        Self::Values(values.into_iter().map(Into::into).collect())
    }
}

/// A routing rule as supplied by configuration.
#[derive(Clone)]
pub struct RawRule {
    pub target: String,
    pub rewrite: Option<Rewrite>,
    pub headers: Vec<(String, HeaderOverride)>,
    pub secure: Option<bool>,
    pub timeout: Option<u64>,
}

impl RawRule {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            rewrite: None,
            headers: Vec::new(),
            secure: None,
            timeout: None,
        }
    }

    pub fn rewrite<F>(mut self, rewrite: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.rewrite = Some(Arc::new(rewrite));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<HeaderOverride>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = Some(secure);
        self
    }

    /// Upstream timeout in milliseconds.
    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }
}

impl fmt::Debug for RawRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRule")
            .field("target", &self.target)
            .field("rewrite", &self.rewrite.is_some())
            .field("headers", &self.headers)
            .field("secure", &self.secure)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Ordered mapping from regex pattern to rule.
///
/// Declaration order is match priority. Re-inserting an existing pattern
/// replaces its rule but keeps its position.
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    rules: Vec<(String, RawRule)>,
}

impl ProxyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, pattern: impl Into<String>, rule: RawRule) -> Self {
        self.insert(pattern, rule);
        self
    }

    pub fn insert(&mut self, pattern: impl Into<String>, rule: RawRule) {
        let pattern = pattern.into();
        match self.rules.iter_mut().find(|(existing, _)| *existing == pattern) {
            Some((_, slot)) => *slot = rule,
            None => self.rules.push((pattern, rule)),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawRule)> {
        self.rules.iter().map(|(pattern, rule)| (pattern.as_str(), rule))
    }
}

impl<P: Into<String>> FromIterator<(P, RawRule)> for ProxyOptions {
    fn from_iter<I: IntoIterator<Item = (P, RawRule)>>(iter: I) -> Self {
        let mut options = Self::new();
        for (pattern, rule) in iter {
            options.insert(pattern, rule);
        }
        options
    }
}

/// A rule ready for matching. Immutable once built.
#[derive(Clone)]
pub struct CompiledRule {
    pub matcher: Regex,
    pub upstream: Upstream,
    pub rewrite: Option<Rewrite>,
    pub headers: Arc<HeaderOverrides>,
    pub secure: bool,
    pub timeout: Duration,
}

impl CompiledRule {
    #[inline]
    pub fn matches(&self, url: &str) -> bool {
        self.matcher.is_match(url)
    }

    pub fn protocol(&self) -> Protocol {
        self.upstream.protocol
    }

    pub fn port(&self) -> u16 {
        self.upstream.port
    }
}

impl fmt::Debug for CompiledRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledRule")
            .field("matcher", &self.matcher.as_str())
            .field("upstream", &self.upstream)
            .field("rewrite", &self.rewrite.is_some())
            .field("headers", &self.headers)
            .field("secure", &self.secure)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Compiles every rule in declaration order.
///
/// # Errors
///
/// Returns the first [`RuleError`] encountered; no partial rule list is ever
/// produced.
pub fn compile(options: &ProxyOptions) -> Result<Vec<CompiledRule>, RuleError> {
    options
        .iter()
        .map(|(pattern, rule)| compile_rule(pattern, rule))
        .collect()
}

fn compile_rule(pattern: &str, rule: &RawRule) -> Result<CompiledRule, RuleError> {
    let matcher = Regex::new(pattern).map_err(|source| RuleError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })?;

    let upstream = parse_target(&rule.target)?;
    let headers = compile_headers(pattern, &rule.headers)?;

    let compiled = CompiledRule {
        matcher,
        upstream,
        rewrite: rule.rewrite.clone(),
        headers: Arc::new(headers),
        secure: rule.secure.unwrap_or(true),
        timeout: Duration::from_millis(rule.timeout.unwrap_or(DEFAULT_TIMEOUT_MS)),
    };
    debug!("Compiled rule `{}` -> {}", pattern, compiled.upstream);
    Ok(compiled)
}

fn parse_target(target: &str) -> Result<Upstream, RuleError> {
    let mut url = Url::parse(target).map_err(|source| match source {
        url::ParseError::InvalidPort => RuleError::InvalidPort {
            target: target.to_string(),
        },
        source => RuleError::InvalidTarget {
            target: target.to_string(),
            source,
        },
    })?;

    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    let protocol =
        Protocol::from_scheme(url.scheme()).ok_or_else(|| RuleError::InvalidProtocol {
            target: url.to_string(),
        })?;

    // The parser only accepts decimal ports and folds default ports away.
    let port = url.port().unwrap_or_else(|| protocol.default_port());

    let hostname = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| RuleError::InvalidTarget {
            target: target.to_string(),
            source: url::ParseError::EmptyHost,
        })?
        .to_string();
    let base_path = url.path().to_string();

    let base = Url::parse(&format!("{protocol}://{hostname}:{port}{base_path}")).map_err(
        |source| RuleError::InvalidTarget {
            target: target.to_string(),
            source,
        },
    )?;

    Ok(Upstream {
        protocol,
        hostname,
        port,
        base_path,
        base,
    })
}

fn compile_headers(
    pattern: &str,
    headers: &[(String, HeaderOverride)],
) -> Result<HeaderOverrides, RuleError> {
    let invalid = |name: &str, reason: String| RuleError::InvalidHeader {
        pattern: pattern.to_string(),
        name: name.to_string(),
        reason,
    };
    let value = |name: &str, value: &str| {
        HeaderValue::from_str(value).map_err(|e| invalid(name, e.to_string()))
    };

    let mut entries = Vec::with_capacity(headers.len());
    for (name, header) in headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(name, e.to_string()))?;
        let action = match header {
            HeaderOverride::Value(v) => HeaderAction::Set(value(name, v)?),
            HeaderOverride::Values(vs) => HeaderAction::SetAll(
                vs.iter()
                    .map(|v| value(name, v))
                    .collect::<Result<_, _>>()?,
            ),
            HeaderOverride::Omit => HeaderAction::Remove,
        };
        entries.push((header_name, action));
    }
    Ok(HeaderOverrides::new(entries))
}

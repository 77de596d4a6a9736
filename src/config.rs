use std::{
    fmt,
    marker::PhantomData,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use regex::Regex;
use reroute_core::{HeaderOverride, ProxyOptions, RawRule};
use serde::{
    Deserialize, Deserializer,
    de::{MapAccess, Visitor},
};
use tracing::debug;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:5173";
pub const DEFAULT_UNCLAIMED_UPGRADE_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid rewrite `{pattern}` for rule `{rule}`: {source}")]
    InvalidRewrite {
        rule: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Mapping that keeps the order keys were declared in.
///
/// A repeated key replaces the earlier value but keeps its position.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<V>(pub Vec<(String, V)>);

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<V> OrderedMap<V> {
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de, V: Deserialize<'de>> Deserialize<'de> for OrderedMap<V> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct OrderedMapVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<V> {
            type Value = OrderedMap<V>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(OrderedMap::default())
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut entries: Vec<(String, V)> =
                    Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, V>()? {
                    match entries.iter_mut().find(|(existing, _)| *existing == key) {
                        Some((_, slot)) => *slot = value,
                        None => entries.push((key, value)),
                    }
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_map(OrderedMapVisitor(PhantomData))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: Option<String>,
    /// Declaration order is match priority.
    #[serde(default)]
    pub proxy: OrderedMap<RuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default = "default_unclaimed_upgrade_timeout_ms")]
    pub unclaimed_upgrade_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            tls: None,
            unclaimed_upgrade_timeout_ms: DEFAULT_UNCLAIMED_UPGRADE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tls {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub target: String,
    pub rewrite: Option<RewriteConfig>,
    #[serde(default)]
    pub headers: OrderedMap<HeaderSetting>,
    pub secure: Option<bool>,
    /// Milliseconds, `0` disables the limit.
    pub timeout: Option<u64>,
}

/// Replaces the first match of `pattern` in the request path and query.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewriteConfig {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum HeaderSetting {
    /// `~` or `null`: drop the header.
    Omit,
    Single(Scalar),
    List(Vec<Scalar>),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Text(text) => f.write_str(text),
            Scalar::Integer(n) => write!(f, "{n}"),
            Scalar::Float(n) => write!(f, "{n}"),
            Scalar::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&HeaderSetting> for HeaderOverride {
    fn from(setting: &HeaderSetting) -> Self {
        match setting {
            HeaderSetting::Omit => HeaderOverride::Omit,
            HeaderSetting::Single(value) => HeaderOverride::Value(value.to_string()),
            HeaderSetting::List(values) => {
                HeaderOverride::Values(values.iter().map(ToString::to_string).collect())
            }
        }
    }
}

fn default_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5173))
}

fn default_unclaimed_upgrade_timeout_ms() -> u64 {
    DEFAULT_UNCLAIMED_UPGRADE_TIMEOUT_MS
}

impl Config {
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn unclaimed_upgrade_timeout(&self) -> Duration {
        Duration::from_millis(self.server.unclaimed_upgrade_timeout_ms)
    }

    /// Builds the rule map handed to the proxy plugin.
    ///
    /// Declarative rewrites become regex replacements of the first match.
    pub fn proxy_options(&self) -> Result<ProxyOptions, ConfigError> {
        let mut options = ProxyOptions::new();
        for (pattern, rule) in self.proxy.iter() {
            let mut raw = RawRule::new(rule.target.clone());

            if let Some(rewrite) = &rule.rewrite {
                let matcher =
                    Regex::new(&rewrite.pattern).map_err(|source| ConfigError::InvalidRewrite {
                        rule: pattern.to_string(),
                        pattern: rewrite.pattern.clone(),
                        source,
                    })?;
                let replacement = rewrite.replacement.clone();
                raw = raw.rewrite(move |url| {
                    matcher
                        .replacen(url, 1, replacement.as_str())
                        .into_owned()
                });
            }
            for (name, setting) in rule.headers.iter() {
                raw = raw.header(name, HeaderOverride::from(setting));
            }
            raw.secure = rule.secure;
            raw.timeout = rule.timeout;

            options.insert(pattern, raw);
        }
        debug!("Loaded {} proxy rules from config", options.len());
        Ok(options)
    }
}

/// Reads a config file. `.json` files are parsed as JSON, anything else as
/// YAML.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => Config::from_json(&contents),
        _ => Config::from_yaml(&contents),
    }
}

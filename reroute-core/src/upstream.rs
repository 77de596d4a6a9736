use std::fmt;

use url::Url;

/// Scheme family of an upstream target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
    Ws,
    Wss,
}

impl Protocol {
    /// Maps a URL scheme (without the trailing `:`) onto a protocol.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "ws" => Some(Self::Ws),
            "wss" => Some(Self::Wss),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    /// Conventional port used when the target URL carries none.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http | Self::Ws => 80,
            Self::Https | Self::Wss => 443,
        }
    }

    /// Whether the upstream connection has to be wrapped in TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Https | Self::Wss)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved upstream of a compiled rule.
///
/// `base` is `protocol://hostname:port/base_path/` parsed once at compile time;
/// every forwarded path is resolved against it.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub protocol: Protocol,
    /// Host as written in URLs, IPv6 literals keep their brackets.
    pub hostname: String,
    pub port: u16,
    /// Always ends with `/`.
    pub base_path: String,
    pub base: Url,
}

/// Host suitable for socket connection and TLS server names: IPv6 literals
/// lose their brackets.
pub fn unbracketed(hostname: &str) -> &str {
    hostname
        .strip_prefix('[')
        .and_then(|host| host.strip_suffix(']'))
        .unwrap_or(hostname)
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.protocol, self.hostname, self.port, self.base_path
        )
    }
}

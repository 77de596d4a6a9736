//! Interface to the forwarding collaborator.
//!
//! The dispatcher never touches sockets itself. For every matched request it
//! builds a [`ForwardTarget`] and hands it, together with the request or the
//! upgrade event, to a [`Forwarder`]. The forwarder computes its default
//! outbound headers and then layers the rule's [`HeaderOverrides`] on top.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use http::{
    HeaderMap, HeaderName, HeaderValue, Request, Response,
    header::{CONNECTION, UPGRADE},
};

use crate::{service::ProxyBody, upgrade::UpgradeEvent, upstream::{Protocol, unbracketed}};

/// Future returned by both forwarding operations.
pub type ForwardFuture = BoxFuture<'static, anyhow::Result<Response<ProxyBody>>>;

/// Hop-by-hop headers that are never copied to the upstream or back.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Address of the downstream client, stored in request extensions by the host.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// A single rule header, validated into wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderAction {
    /// Replace whatever the forwarder computed with one value.
    Set(HeaderValue),
    /// Replace with several values, sent in order.
    SetAll(Vec<HeaderValue>),
    /// Drop the header from the outbound request.
    Remove,
}

/// Ordered header overrides of a compiled rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderOverrides {
    entries: Vec<(HeaderName, HeaderAction)>,
}

impl HeaderOverrides {
    pub fn new(entries: Vec<(HeaderName, HeaderAction)>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(HeaderName, HeaderAction)> {
        self.entries.iter()
    }

    /// Layers the overrides over `headers`. Rule values win on collision.
    pub fn apply(&self, headers: &mut HeaderMap) {
        for (name, action) in &self.entries {
            match action {
                HeaderAction::Set(value) => {
                    headers.insert(name.clone(), value.clone());
                }
                HeaderAction::SetAll(values) => {
                    headers.remove(name);
                    for value in values {
                        headers.append(name.clone(), value.clone());
                    }
                }
                HeaderAction::Remove => {
                    headers.remove(name);
                }
            }
        }
    }
}

/// Fully resolved destination of one matched request.
///
/// Built fresh per request by the dispatcher and consumed by the forwarder.
#[derive(Debug, Clone)]
pub struct ForwardTarget {
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    /// Path and query sent in the upstream request line.
    pub path: String,
    /// Zero disables the limit.
    pub timeout: Duration,
    pub verify_upstream_cert: bool,
    pub header_overrides: Arc<HeaderOverrides>,
}

impl ForwardTarget {
    /// Host without IPv6 brackets.
    pub fn connect_host(&self) -> &str {
        unbracketed(&self.hostname)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }
}

/// The forwarding collaborator.
pub trait Forwarder: Send + Sync {
    /// Forwards a plain HTTP request and resolves to the upstream response.
    fn forward_http(&self, request: Request<ProxyBody>, target: ForwardTarget) -> ForwardFuture;

    /// Forwards an upgrade handshake.
    ///
    /// Resolves to the response relayed to the client; when the upstream
    /// switches protocols the forwarder tunnels the event's transport to it.
    fn forward_upgrade(&self, event: UpgradeEvent, target: ForwardTarget) -> ForwardFuture;
}

/// Default outbound headers for a plain request.
///
/// Hop-by-hop headers (and any header named in `Connection`) are stripped and
/// the client address is appended to `x-forwarded-for`.
pub fn outbound_headers(incoming: &HeaderMap, client: Option<SocketAddr>) -> HeaderMap {
    let mut headers = incoming.clone();
    strip_hop_by_hop(&mut headers);
    append_forwarded_for(&mut headers, client);
    headers
}

/// Default outbound headers for an upgrade handshake.
///
/// Same as [`outbound_headers`] but `Connection: upgrade` and the `Upgrade`
/// token survive, the upstream needs them to switch protocols.
pub fn outbound_upgrade_headers(incoming: &HeaderMap, client: Option<SocketAddr>) -> HeaderMap {
    let upgrade = incoming.get(UPGRADE).cloned();
    let mut headers = outbound_headers(incoming, client);
    if let Some(upgrade) = upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(UPGRADE, upgrade);
    }
    headers
}

/// Removes hop-by-hop headers in place.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client: Option<SocketAddr>) {
    let Some(client) = client else {
        return;
    };
    let ip = client.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {ip}"),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}

//! Request router and dispatcher.
//!
//! The [`Dispatcher`] owns the compiled rules and the forwarding collaborator.
//! It is registered twice on the host: as a [`Middleware`] for plain requests
//! and as an [`UpgradeListener`] for protocol switch handshakes. Both paths
//! share [`Dispatcher::find_rule`] and [`Dispatcher::resolve`] and only differ
//! in which forwarding operation they call.

use std::sync::Arc;

use anyhow::Context as _;
use http::Request;
use tracing::{debug, warn};

use crate::{
    forward::{ForwardTarget, Forwarder},
    middleware::{Flow, Middleware, MiddlewareFuture},
    rule::CompiledRule,
    service::ProxyBody,
    upgrade::{UpgradeEvent, UpgradeListener, UpgradeOutcome},
    utils::resolve_forward_path,
};

pub struct Dispatcher {
    rules: Arc<[CompiledRule]>,
    forwarder: Arc<dyn Forwarder>,
}

impl Dispatcher {
    pub fn new(rules: Vec<CompiledRule>, forwarder: Arc<dyn Forwarder>) -> Self {
        Self {
            rules: rules.into(),
            forwarder,
        }
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// First rule, in declaration order, whose pattern matches `url`.
    pub fn find_rule(&self, url: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|rule| rule.matches(url))
    }

    /// Builds the forward descriptor of `url` for a matched rule.
    ///
    /// The rewrite runs first, leading slashes are stripped and the result is
    /// resolved against the rule's upstream base.
    pub fn resolve(rule: &CompiledRule, url: &str) -> anyhow::Result<ForwardTarget> {
        let rewritten = match &rule.rewrite {
            Some(rewrite) => rewrite(url),
            None => url.to_string(),
        };
        let path = resolve_forward_path(&rule.upstream.base, &rewritten).with_context(|| {
            format!("Cannot resolve `{}` against {}", rewritten, rule.upstream)
        })?;

        Ok(ForwardTarget {
            protocol: rule.upstream.protocol,
            hostname: rule.upstream.hostname.clone(),
            port: rule.upstream.port,
            path,
            timeout: rule.timeout,
            verify_upstream_cert: rule.secure,
            header_overrides: rule.headers.clone(),
        })
    }

    /// Matches and resolves in one step. `None` when no rule applies.
    pub fn route(&self, url: &str) -> Option<anyhow::Result<ForwardTarget>> {
        self.find_rule(url).map(|rule| Self::resolve(rule, url))
    }
}

fn request_url<B>(request: &Request<B>) -> &str {
    request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
}

impl Middleware for Dispatcher {
    fn handle(&self, request: Request<ProxyBody>) -> MiddlewareFuture<'_> {
        let target = match self.route(request_url(&request)) {
            None => return Box::pin(async move { Ok(Flow::Next(request)) }),
            Some(Err(e)) => return Box::pin(async move { Err(e) }),
            Some(Ok(target)) => target,
        };

        debug!(
            "Forwarding {} {} to {}://{}:{}{}",
            request.method(),
            request.uri(),
            target.protocol,
            target.hostname,
            target.port,
            target.path
        );
        let forwarded = self.forwarder.forward_http(request, target);
        Box::pin(async move { forwarded.await.map(Flow::Respond) })
    }
}

impl UpgradeListener for Dispatcher {
    fn on_upgrade(&self, event: UpgradeEvent) -> UpgradeOutcome {
        let target = match self.route(event.url()) {
            None => {
                debug!("No rule for upgrade {}, leaving it", event.url());
                return UpgradeOutcome::Declined(event);
            }
            Some(Err(e)) => {
                warn!("Dropping upgrade {}: {:#}", event.url(), e);
                return UpgradeOutcome::Claimed(Box::pin(async move { Err(e) }));
            }
            Some(Ok(target)) => target,
        };

        debug!(
            "Forwarding upgrade {} to {}://{}:{}{}",
            event.url(),
            target.protocol,
            target.hostname,
            target.port,
            target.path
        );
        UpgradeOutcome::Claimed(self.forwarder.forward_upgrade(event, target))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("rules", &self.rules)
            .finish()
    }
}

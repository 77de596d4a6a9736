//! Plugin surface of the host server.

use std::sync::Arc;

use tracing::info;

use crate::{
    dispatch::Dispatcher,
    forward::Forwarder,
    middleware::Middlewares,
    rule::{ProxyOptions, RuleError, compile},
    upgrade::UpgradeListeners,
};

/// What a plugin hook gets to configure.
pub struct ServerHandle<'a> {
    /// Request pipeline of the host.
    pub middlewares: &'a mut Middlewares,
    /// Upgrade event source of the underlying HTTP server.
    pub http_server: &'a mut UpgradeListeners,
}

/// A host server plugin.
///
/// The host calls exactly one of the hooks, depending on whether it runs as
/// the dev server or the preview server. A failing hook aborts startup.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn configure_server(&self, server: &mut ServerHandle<'_>) -> anyhow::Result<()>;

    fn configure_preview_server(&self, server: &mut ServerHandle<'_>) -> anyhow::Result<()>;
}

/// Installs the rule based proxy on the host.
///
/// Rules are compiled when a hook runs. The resulting [`Dispatcher`] is
/// registered once as a middleware and once as an upgrade listener, sharing
/// the same compiled rules.
pub struct ProxyPlugin {
    options: ProxyOptions,
    forwarder: Arc<dyn Forwarder>,
}

impl ProxyPlugin {
    pub const NAME: &'static str = "reroute:proxy";

    pub fn new(options: ProxyOptions, forwarder: Arc<dyn Forwarder>) -> Self {
        Self { options, forwarder }
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    fn install(&self, server: &mut ServerHandle<'_>) -> Result<(), RuleError> {
        let rules = compile(&self.options)?;
        let count = rules.len();
        let dispatcher = Arc::new(Dispatcher::new(rules, self.forwarder.clone()));

        server.middlewares.add(dispatcher.clone());
        server.http_server.on(dispatcher);
        info!("Installed {} proxy rules", count);
        Ok(())
    }
}

impl Plugin for ProxyPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn configure_server(&self, server: &mut ServerHandle<'_>) -> anyhow::Result<()> {
        self.install(server)?;
        Ok(())
    }

    fn configure_preview_server(&self, server: &mut ServerHandle<'_>) -> anyhow::Result<()> {
        self.install(server)?;
        Ok(())
    }
}

impl std::fmt::Debug for ProxyPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPlugin")
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        forward::{ForwardFuture, ForwardTarget},
        rule::RawRule,
        service::ProxyBody,
        upgrade::UpgradeEvent,
    };
    use http::Request;

    struct Unused;

    impl Forwarder for Unused {
        fn forward_http(&self, _request: Request<ProxyBody>, _target: ForwardTarget) -> ForwardFuture {
            Box::pin(async { anyhow::bail!("not expected") })
        }

        fn forward_upgrade(&self, _event: UpgradeEvent, _target: ForwardTarget) -> ForwardFuture {
            Box::pin(async { anyhow::bail!("not expected") })
        }
    }

    fn plugin(options: ProxyOptions) -> ProxyPlugin {
        ProxyPlugin::new(options, Arc::new(Unused))
    }

    #[test]
    fn test_both_hooks_register_one_of_each() {
        let plugin = plugin(ProxyOptions::new().rule("^/api", RawRule::new("http://api.local")));
        assert_eq!(plugin.name(), "reroute:proxy");

        let mut middlewares = Middlewares::new();
        let mut upgrades = UpgradeListeners::new();
        plugin
            .configure_server(&mut ServerHandle {
                middlewares: &mut middlewares,
                http_server: &mut upgrades,
            })
            .unwrap();
        assert_eq!(middlewares.len(), 1);
        assert_eq!(upgrades.len(), 1);

        let mut middlewares = Middlewares::new();
        let mut upgrades = UpgradeListeners::new();
        plugin
            .configure_preview_server(&mut ServerHandle {
                middlewares: &mut middlewares,
                http_server: &mut upgrades,
            })
            .unwrap();
        assert_eq!(middlewares.len(), 1);
        assert_eq!(upgrades.len(), 1);
    }

    #[test]
    fn test_invalid_rule_registers_nothing() {
        let plugin = plugin(
            ProxyOptions::new()
                .rule("^/api", RawRule::new("http://api.local"))
                .rule("^/ftp", RawRule::new("ftp://files.local")),
        );

        let mut middlewares = Middlewares::new();
        let mut upgrades = UpgradeListeners::new();
        let err = plugin
            .configure_server(&mut ServerHandle {
                middlewares: &mut middlewares,
                http_server: &mut upgrades,
            })
            .unwrap_err();

        assert!(err.to_string().contains("ftp://files.local"));
        assert!(middlewares.is_empty());
        assert!(upgrades.is_empty());
    }

    #[test]
    fn test_empty_options_still_install() {
        let plugin = plugin(ProxyOptions::new());
        let mut middlewares = Middlewares::new();
        let mut upgrades = UpgradeListeners::new();
        plugin
            .configure_server(&mut ServerHandle {
                middlewares: &mut middlewares,
                http_server: &mut upgrades,
            })
            .unwrap();
        assert_eq!(middlewares.len(), 1);
    }
}

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context as _, Result};
use hyper_util::{
    rt::{TokioExecutor, TokioIo as HyperSocket},
    server::conn::auto::Builder,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::{
    middleware::Middlewares,
    plugin::{Plugin, ServerHandle},
    service::HostService,
    upgrade::UpgradeListeners,
};

/// Which plugin hook configures the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    #[default]
    Dev,
    Preview,
}

/// Host HTTP server.
///
/// Owns the TCP listener, the optional TLS acceptor and the service built from
/// the plugins' middlewares and upgrade listeners.
pub struct Server {
    /// The TCP listener for accepting incoming connections
    connection: TcpListener,
    service: HostService,
    tls_acceptor: Option<TlsAcceptor>,
    _accept: fn(&Server, HostService, TcpStream),
}

impl Server {
    /// Binds the listener and lets every plugin configure the server.
    ///
    /// # Arguments
    ///
    /// * `addr` - The network address to bind to
    /// * `plugins` - Plugins, configured in order
    /// * `mode` - Selects the dev or preview hook
    /// * `tls_acceptor` - Optional TLS acceptor for secure connections
    /// * `unclaimed_upgrade_timeout` - How long unclaimed upgrades are held
    ///
    /// # Returns
    ///
    /// The first plugin error aborts startup before anything is bound.
    pub async fn new(
        addr: SocketAddr,
        plugins: &[Arc<dyn Plugin>],
        mode: ServerMode,
        tls_acceptor: Option<TlsAcceptor>,
        unclaimed_upgrade_timeout: Duration,
    ) -> Result<Self> {
        let mut middlewares = Middlewares::new();
        let mut upgrades = UpgradeListeners::new();
        {
            let mut handle = ServerHandle {
                middlewares: &mut middlewares,
                http_server: &mut upgrades,
            };
            for plugin in plugins {
                debug!("Configuring plugin {} ({:?})", plugin.name(), mode);
                let configured = match mode {
                    ServerMode::Dev => plugin.configure_server(&mut handle),
                    ServerMode::Preview => plugin.configure_preview_server(&mut handle),
                };
                configured.with_context(|| {
                    format!("Plugin {} failed to configure the server", plugin.name())
                })?;
            }
        }

        let connection = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!(
            "Listening on {}://{}",
            if tls_acceptor.is_some() { "https" } else { "http" },
            connection.local_addr()?
        );

        Ok(Self {
            _accept: if tls_acceptor.is_some() {
                debug!("Setting up tls acceptor");
                Self::_tls_acceptor
            } else {
                debug!("Setting up non-tls acceptor");
                Self::_non_tls_acceptor
            },
            connection,
            service: HostService::new(middlewares, upgrades, unclaimed_upgrade_timeout),
            tls_acceptor,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.connection.local_addr()?)
    }

    fn _non_tls_acceptor(_: &Self, service: HostService, conn: TcpStream) {
        let io = HyperSocket::new(conn);

        tokio::spawn(async move {
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                debug!("Error serving non tls connection: {:?}", e);
            }
        });
    }

    fn _tls_acceptor(server: &Self, service: HostService, conn: TcpStream) {
        let Some(acceptor) = server.tls_acceptor.clone() else {
            error!("TLS acceptor missing, dropping connection from {}", service.from);
            return;
        };

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(conn).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    error!("failed to perform tls handshake: {err:#}");
                    return;
                }
            };
            let io = HyperSocket::new(tls_stream);
            if let Err(e) = Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                debug!("Error serving tls connection: {:?}", e);
            }
        });
    }

    /// Accepts a new connection and spawns a task to serve it.
    pub async fn accept(&self) -> Result<()> {
        let (conn, address) = self.connection.accept().await?;

        let service = self.service.for_client(address);

        (self._accept)(self, service, conn);
        Ok(())
    }
}

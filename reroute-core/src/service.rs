//! Host request service.
//!
//! [`HostService`] is what the server hands to hyper for every connection. It
//! tags each request with the client address, routes upgrade handshakes to the
//! registered [`UpgradeListeners`], and runs everything else through the
//! [`Middlewares`] pipeline.

use std::{net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use http::{
    Request, Response, StatusCode,
    header::{CONNECTION, UPGRADE},
};
use http_body_util::{BodyExt as _, Empty, combinators::BoxBody};
use hyper::{
    body::{Bytes, Incoming},
    service::Service as HyperService,
};
use tracing::{debug, error, warn};

use crate::{
    forward::ClientAddr,
    middleware::{Flow, Middlewares},
    upgrade::{UpgradeEvent, UpgradeListeners},
};

/// Error carried by [`ProxyBody`] frames.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type flowing through the pipeline and the forwarder.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// Function type for generating the response of unhandled requests.
pub type NotFoundFunction = fn() -> Response<ProxyBody>;

/// How long an unclaimed upgrade is held before the connection is dropped.
pub const DEFAULT_UNCLAIMED_UPGRADE_TIMEOUT: Duration = Duration::from_secs(120);

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = status;
    response
}

fn not_found() -> Response<ProxyBody> {
    status_response(StatusCode::NOT_FOUND)
}

/// Returns `true` for HTTP/1.1 protocol switch handshakes.
pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
    let connection_upgrade = request
        .headers()
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    connection_upgrade && request.headers().contains_key(UPGRADE)
}

/// Per-connection service of the host server.
#[derive(Clone)]
pub struct HostService {
    middlewares: Arc<Middlewares>,
    upgrades: Arc<UpgradeListeners>,
    not_found: NotFoundFunction,
    unclaimed_upgrade_timeout: Duration,
    pub from: SocketAddr,
}

impl HostService {
    pub fn new(
        middlewares: Middlewares,
        upgrades: UpgradeListeners,
        unclaimed_upgrade_timeout: Duration,
    ) -> Self {
        debug!(
            "Creating host service with {} middlewares and {} upgrade listeners",
            middlewares.len(),
            upgrades.len()
        );
        Self {
            middlewares: Arc::new(middlewares),
            upgrades: Arc::new(upgrades),
            not_found,
            unclaimed_upgrade_timeout,
            from: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }

    /// Replaces the response sent when no middleware handles a request.
    pub fn with_not_found(mut self, not_found: NotFoundFunction) -> Self {
        self.not_found = not_found;
        self
    }

    /// Same service bound to a specific client connection.
    pub fn for_client(&self, from: SocketAddr) -> Self {
        let mut service = self.clone();
        service.from = from;
        service
    }

    /// Runs a plain request through the middleware pipeline.
    ///
    /// Unhandled requests get the not-found response, pipeline errors an
    /// empty `500`.
    pub async fn handle_request(&self, request: Request<ProxyBody>) -> Response<ProxyBody> {
        let method = request.method().clone();
        let uri = request.uri().clone();

        match self.middlewares.run(request).await {
            Ok(Flow::Respond(response)) => response,
            Ok(Flow::Next(_)) => {
                debug!("No middleware handled {} {}", method, uri);
                (self.not_found)()
            }
            Err(e) => {
                error!("Request {} {} failed: {:#}", method, uri, e);
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Offers an upgrade to the listeners.
    ///
    /// An unclaimed upgrade gets no response at all: the event is held until
    /// the timeout elapses, then the connection is dropped.
    pub async fn handle_upgrade(&self, event: UpgradeEvent) -> anyhow::Result<Response<ProxyBody>> {
        let uri = event.parts.uri.clone();
        match self.upgrades.emit(event) {
            Ok(claimed) => claimed.await.map_err(|e| {
                error!("Upgrade {} failed, closing connection: {:#}", uri, e);
                e
            }),
            Err(unclaimed) => {
                warn!("Upgrade {} was not claimed by any listener", uri);
                tokio::time::sleep(self.unclaimed_upgrade_timeout).await;
                drop(unclaimed);
                Err(anyhow::anyhow!("Upgrade {} was not claimed", uri))
            }
        }
    }
}

impl HyperService<Request<Incoming>> for HostService {
    type Response = Response<ProxyBody>;

    type Error = anyhow::Error;

    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, mut req: Request<Incoming>) -> Self::Future {
        debug!("Processing request from {}: {} {}", self.from, req.method(), req.uri());
        req.extensions_mut().insert(ClientAddr(self.from));

        let service = self.clone();
        if is_upgrade_request(&req) {
            let transport = hyper::upgrade::on(&mut req);
            let (parts, _body) = req.into_parts();
            let event = UpgradeEvent::new(parts, transport, Bytes::new());
            Box::pin(async move { service.handle_upgrade(event).await })
        } else {
            let req = req.map(|body| body.map_err(BoxError::from).boxed());
            Box::pin(async move { Ok(service.handle_request(req).await) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        middleware::from_fn,
        upgrade::{UpgradeListener, UpgradeOutcome},
    };
    use http::request::Parts;

    fn request(uri: &str) -> Request<ProxyBody> {
        Request::builder().uri(uri).body(empty()).unwrap()
    }

    fn upgrade_event(uri: &str) -> UpgradeEvent {
        let mut req = Request::builder()
            .uri(uri)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        let transport = hyper::upgrade::on(&mut req);
        let (parts, ()) = req.into_parts();
        UpgradeEvent::new(parts, transport, Bytes::new())
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder()
            .header(UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));

        let req = Request::builder()
            .header(CONNECTION, "upgrade")
            .body(())
            .unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[tokio::test]
    async fn test_unhandled_request_is_not_found() {
        let service = HostService::new(
            Middlewares::new(),
            UpgradeListeners::new(),
            DEFAULT_UNCLAIMED_UPGRADE_TIMEOUT,
        );
        let response = service.handle_request(request("/missing")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_custom_not_found() {
        let service = HostService::new(
            Middlewares::new(),
            UpgradeListeners::new(),
            DEFAULT_UNCLAIMED_UPGRADE_TIMEOUT,
        )
        .with_not_found(|| status_response(StatusCode::IM_A_TEAPOT));
        let response = service.handle_request(request("/missing")).await;
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    }

    #[tokio::test]
    async fn test_pipeline_error_is_internal_error() {
        let mut middlewares = Middlewares::new();
        middlewares.add(from_fn(|_| {
            Box::pin(async { Err(anyhow::anyhow!("upstream unreachable")) })
        }));
        let service = HostService::new(
            middlewares,
            UpgradeListeners::new(),
            DEFAULT_UNCLAIMED_UPGRADE_TIMEOUT,
        );
        let response = service.handle_request(request("/api")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unclaimed_upgrade_is_dropped_after_timeout() {
        let service = HostService::new(
            Middlewares::new(),
            UpgradeListeners::new(),
            Duration::from_millis(10),
        );
        let err = service.handle_upgrade(upgrade_event("/ws")).await.unwrap_err();
        assert!(err.to_string().contains("not claimed"));
    }

    struct Refuse;

    impl UpgradeListener for Refuse {
        fn on_upgrade(&self, event: UpgradeEvent) -> UpgradeOutcome {
            let parts: &Parts = &event.parts;
            assert_eq!(parts.uri, "/ws");
            UpgradeOutcome::Claimed(Box::pin(async { Err(anyhow::anyhow!("refused")) }))
        }
    }

    #[tokio::test]
    async fn test_claimed_upgrade_error_propagates() {
        let mut upgrades = UpgradeListeners::new();
        upgrades.on(Arc::new(Refuse));
        let service = HostService::new(
            Middlewares::new(),
            upgrades,
            DEFAULT_UNCLAIMED_UPGRADE_TIMEOUT,
        );
        let err = service.handle_upgrade(upgrade_event("/ws")).await.unwrap_err();
        assert_eq!(err.to_string(), "refused");
    }
}

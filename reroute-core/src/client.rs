//! hyper based forwarding collaborator.
//!
//! Every forwarded request gets its own upstream connection: TCP, optionally
//! wrapped in rustls, then an HTTP/1.1 handshake. Nothing is pooled and
//! nothing is retried.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use anyhow::{Context as _, Result, anyhow};
use http::{
    HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, Version, header::HOST,
    request::Parts,
};
use http_body_util::BodyExt as _;
use hyper::{
    body::{Body, Bytes, Frame, Incoming, SizeHint},
    client::conn::http1::{Builder, SendRequest},
    upgrade::{OnUpgrade, Upgraded},
};
use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncWriteExt as _, copy_bidirectional},
    net::TcpStream,
    sync::OnceCell,
    time::{Instant, Sleep},
};
use tokio_rustls::{TlsConnector, rustls::pki_types::ServerName};
use tracing::{debug, error, warn};

use crate::{
    forward::{
        ClientAddr, ForwardFuture, ForwardTarget, Forwarder, outbound_headers,
        outbound_upgrade_headers, strip_hop_by_hop,
    },
    service::{BoxError, ProxyBody, empty},
    tls,
    upgrade::UpgradeEvent,
};

#[derive(Default)]
struct Connectors {
    verified: OnceCell<TlsConnector>,
    insecure: OnceCell<TlsConnector>,
}

/// Forwards requests and upgrade handshakes over fresh HTTP/1.1 connections.
///
/// TLS client configs are built on first use, so a host without native root
/// certificates can still proxy plain and `secure: false` targets.
#[derive(Clone, Default)]
pub struct HyperForwarder {
    connectors: Arc<Connectors>,
}

impl HyperForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connector(&self, verify: bool) -> Result<TlsConnector> {
        let cell = if verify {
            &self.connectors.verified
        } else {
            &self.connectors.insecure
        };
        let connector = cell
            .get_or_try_init(|| async { tls::client_config(verify).map(TlsConnector::from) })
            .await?;
        Ok(connector.clone())
    }

    /// Opens a connection to the target and performs the HTTP/1.1 handshake.
    async fn open(&self, target: &ForwardTarget) -> Result<SendRequest<ProxyBody>> {
        let host = target.connect_host();
        let stream = TcpStream::connect((host, target.port))
            .await
            .with_context(|| format!("Failed to connect to upstream {}:{}", host, target.port))?;
        debug!("Connected to upstream {}:{}", host, target.port);

        if !target.protocol.is_tls() {
            return handshake(TokioIo::new(stream)).await;
        }

        let server_name = ServerName::try_from(host.to_string())
            .with_context(|| format!("Invalid TLS server name {}", host))?;
        let stream = self
            .connector(target.verify_upstream_cert)
            .await?
            .connect(server_name, stream)
            .await
            .with_context(|| format!("TLS handshake with {}:{} failed", host, target.port))?;
        debug!("TLS established with upstream {}:{}", host, target.port);
        handshake(TokioIo::new(stream)).await
    }

    /// Connects and sends `request`, bounded by the target's timeout.
    async fn exchange(
        &self,
        request: Request<ProxyBody>,
        target: &ForwardTarget,
    ) -> Result<Response<Incoming>> {
        let send = async {
            let mut sender = self.open(target).await?;
            sender
                .send_request(request)
                .await
                .context("Upstream request failed")
        };

        match target.timeout() {
            Some(limit) => tokio::time::timeout(limit, send)
                .await
                .map_err(|_| timed_out(target, limit))?,
            None => send.await,
        }
    }

    async fn http(
        &self,
        request: Request<ProxyBody>,
        target: ForwardTarget,
    ) -> Result<Response<ProxyBody>> {
        let (mut parts, body) = request.into_parts();
        let client = parts.extensions.get::<ClientAddr>().map(|addr| addr.0);

        let mut headers = outbound_headers(&parts.headers, client);
        target.header_overrides.apply(&mut headers);
        keep_host(&mut headers, &parts);

        parts.headers = headers;
        parts.uri = upstream_uri(&target)?;
        parts.version = Version::HTTP_11;

        let response = self
            .exchange(Request::from_parts(parts, body), &target)
            .await?;
        debug!(
            "Upstream {}:{} answered {}",
            target.hostname,
            target.port,
            response.status()
        );
        Ok(relay(response, target.timeout()))
    }

    async fn upgrade(
        &self,
        event: UpgradeEvent,
        target: ForwardTarget,
    ) -> Result<Response<ProxyBody>> {
        let UpgradeEvent {
            parts,
            transport,
            head,
        } = event;
        let client = parts.extensions.get::<ClientAddr>().map(|addr| addr.0);

        let mut headers = outbound_upgrade_headers(&parts.headers, client);
        target.header_overrides.apply(&mut headers);
        keep_host(&mut headers, &parts);

        let mut request = Request::new(empty());
        *request.method_mut() = parts.method.clone();
        *request.uri_mut() = upstream_uri(&target)?;
        *request.headers_mut() = headers;

        let mut response = self.exchange(request, &target).await?;
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            warn!(
                "Upstream {}:{} refused to switch protocols: {}",
                target.hostname,
                target.port,
                response.status()
            );
            return Ok(relay(response, target.timeout()));
        }

        let upstream = hyper::upgrade::on(&mut response);
        let peer = format!("{}:{}", target.hostname, target.port);
        tokio::spawn(async move {
            if let Err(e) = tunnel(transport, upstream, head).await {
                warn!("Tunnel to {} closed with error: {:#}", peer, e);
            }
        });

        let (parts, _) = response.into_parts();
        Ok(Response::from_parts(parts, empty()))
    }
}

impl Forwarder for HyperForwarder {
    fn forward_http(&self, request: Request<ProxyBody>, target: ForwardTarget) -> ForwardFuture {
        let forwarder = self.clone();
        Box::pin(async move { forwarder.http(request, target).await })
    }

    fn forward_upgrade(&self, event: UpgradeEvent, target: ForwardTarget) -> ForwardFuture {
        let forwarder = self.clone();
        Box::pin(async move { forwarder.upgrade(event, target).await })
    }
}

impl std::fmt::Debug for HyperForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperForwarder")
            .field("verified_tls", &self.connectors.verified.initialized())
            .field("insecure_tls", &self.connectors.insecure.initialized())
            .finish()
    }
}

async fn handshake<I>(io: I) -> Result<SendRequest<ProxyBody>>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, conn) = Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(io)
        .await
        .context("HTTP handshake with upstream failed")?;

    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            error!("Upstream connection error: {}", err);
        }
    });
    Ok(sender)
}

/// Copies bytes both ways once both sides have switched protocols.
async fn tunnel(client: OnUpgrade, upstream: OnUpgrade, head: Bytes) -> Result<()> {
    let client: Upgraded = client.await.context("Client upgrade failed")?;
    let upstream: Upgraded = upstream.await.context("Upstream upgrade failed")?;
    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);

    if !head.is_empty() {
        upstream.write_all(&head).await?;
    }
    let (sent, received) = copy_bidirectional(&mut client, &mut upstream).await?;
    debug!("Tunnel closed: {} bytes sent, {} bytes received", sent, received);
    Ok(())
}

fn upstream_uri(target: &ForwardTarget) -> Result<Uri> {
    target
        .path
        .parse()
        .with_context(|| format!("Invalid upstream path {}", target.path))
}

/// HTTP/2 requests carry the host in the URI authority only.
fn keep_host(headers: &mut HeaderMap, parts: &Parts) {
    if headers.contains_key(HOST) {
        return;
    }
    if let Some(value) = parts
        .uri
        .authority()
        .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
    {
        headers.insert(HOST, value);
    }
}

fn relay(response: Response<Incoming>, idle: Option<Duration>) -> Response<ProxyBody> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    let body = match idle {
        Some(idle) => IdleTimeoutBody::new(body, idle).boxed(),
        None => body.map_err(BoxError::from).boxed(),
    };
    Response::from_parts(parts, body)
}

/// Upstream response body that fails once no frame has arrived for `idle`.
struct IdleTimeoutBody<B> {
    inner: B,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl<B> IdleTimeoutBody<B> {
    fn new(inner: B, idle: Duration) -> Self {
        Self {
            inner,
            idle,
            deadline: Box::pin(tokio::time::sleep(idle)),
        }
    }
}

impl<B> Body for IdleTimeoutBody<B>
where
    B: Body + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = B::Data;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(frame) => {
                this.deadline.as_mut().reset(Instant::now() + this.idle);
                Poll::Ready(frame.map(|frame| frame.map_err(Into::into)))
            }
            Poll::Pending => match this.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Some(Err(format!(
                    "Upstream body idle for {}ms",
                    this.idle.as_millis()
                )
                .into()))),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn timed_out(target: &ForwardTarget, limit: Duration) -> anyhow::Error {
    anyhow!(
        "Upstream {}:{} timed out after {}ms",
        target.hostname,
        target.port,
        limit.as_millis()
    )
}

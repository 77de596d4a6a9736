//! Upgrade event source of the host server.
//!
//! Protocol switch handshakes bypass the middleware pipeline. Each one becomes
//! an [`UpgradeEvent`] that is offered to the registered listeners in order.
//! A listener either claims it, taking ownership of the client transport, or
//! hands the event back untouched for the next listener.

use std::sync::Arc;

use http::request::Parts;
use hyper::{body::Bytes, upgrade::OnUpgrade};
use tracing::debug;

use crate::forward::ForwardFuture;

/// A client asking to switch protocols.
pub struct UpgradeEvent {
    /// Request head of the handshake.
    pub parts: Parts,
    /// Client transport, available once the handshake response is sent.
    pub transport: OnUpgrade,
    /// Bytes already read past the request head, written to the upstream
    /// before tunnelling starts. Hyper replays such bytes through the upgraded
    /// transport itself, so hosts built on it pass an empty buffer.
    pub head: Bytes,
}

impl UpgradeEvent {
    pub fn new(parts: Parts, transport: OnUpgrade, head: Bytes) -> Self {
        Self {
            parts,
            transport,
            head,
        }
    }

    /// Path and query of the handshake request.
    pub fn url(&self) -> &str {
        self.parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }
}

impl std::fmt::Debug for UpgradeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeEvent")
            .field("method", &self.parts.method)
            .field("uri", &self.parts.uri)
            .field("head", &self.head.len())
            .finish()
    }
}

/// What a listener did with an event.
pub enum UpgradeOutcome {
    /// The listener owns the event; the future resolves to the handshake
    /// response, an error tears the connection down.
    Claimed(ForwardFuture),
    /// Not for this listener; the event is returned unconsumed.
    Declined(UpgradeEvent),
}

pub trait UpgradeListener: Send + Sync {
    fn on_upgrade(&self, event: UpgradeEvent) -> UpgradeOutcome;
}

/// Listeners subscribed to the host's upgrade event.
#[derive(Clone, Default)]
pub struct UpgradeListeners {
    listeners: Vec<Arc<dyn UpgradeListener>>,
}

impl UpgradeListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a listener to the upgrade event.
    pub fn on(&mut self, listener: Arc<dyn UpgradeListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Offers the event to each listener in order.
    ///
    /// # Returns
    ///
    /// The claiming listener's future, or the event itself when nobody
    /// claimed it.
    pub fn emit(&self, mut event: UpgradeEvent) -> Result<ForwardFuture, UpgradeEvent> {
        for (i, listener) in self.listeners.iter().enumerate() {
            match listener.on_upgrade(event) {
                UpgradeOutcome::Claimed(future) => {
                    debug!("Upgrade listener {} claimed the event", i);
                    return Ok(future);
                }
                UpgradeOutcome::Declined(returned) => event = returned,
            }
        }
        Err(event)
    }
}

impl std::fmt::Debug for UpgradeListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeListeners")
            .field("len", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::empty;
    use http::{Request, Response, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(uri: &str) -> UpgradeEvent {
        let mut req = Request::builder().uri(uri).body(()).unwrap();
        let transport = hyper::upgrade::on(&mut req);
        let (parts, ()) = req.into_parts();
        UpgradeEvent::new(parts, transport, Bytes::from_static(b"preface"))
    }

    struct Decline(Arc<AtomicUsize>);

    impl UpgradeListener for Decline {
        fn on_upgrade(&self, event: UpgradeEvent) -> UpgradeOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            UpgradeOutcome::Declined(event)
        }
    }

    struct Accept(StatusCode);

    impl UpgradeListener for Accept {
        fn on_upgrade(&self, event: UpgradeEvent) -> UpgradeOutcome {
            assert_eq!(&event.head[..], b"preface");
            let status = self.0;
            UpgradeOutcome::Claimed(Box::pin(async move {
                let mut response = Response::new(empty());
                *response.status_mut() = status;
                Ok(response)
            }))
        }
    }

    #[tokio::test]
    async fn test_first_claiming_listener_wins() {
        let declined = Arc::new(AtomicUsize::new(0));
        let mut listeners = UpgradeListeners::new();
        listeners.on(Arc::new(Decline(declined.clone())));
        listeners.on(Arc::new(Accept(StatusCode::SWITCHING_PROTOCOLS)));
        listeners.on(Arc::new(Accept(StatusCode::BAD_REQUEST)));

        let future = listeners.emit(event("/ws")).unwrap();
        assert_eq!(future.await.unwrap().status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(declined.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unclaimed_event_is_returned() {
        let declined = Arc::new(AtomicUsize::new(0));
        let mut listeners = UpgradeListeners::new();
        listeners.on(Arc::new(Decline(declined.clone())));
        listeners.on(Arc::new(Decline(declined.clone())));

        let returned = listeners.emit(event("/socket?room=1")).err().unwrap();
        assert_eq!(returned.url(), "/socket?room=1");
        assert_eq!(&returned.head[..], b"preface");
        assert_eq!(declined.load(Ordering::SeqCst), 2);
    }
}

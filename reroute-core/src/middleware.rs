use std::sync::Arc;

use futures::future::BoxFuture;
use http::{Request, Response};
use tracing::{debug, error};

use crate::service::ProxyBody;

/// Result of a single middleware step.
pub enum Flow {
    /// Pass the request on to the next middleware.
    Next(Request<ProxyBody>),
    /// The request was handled; stop the pipeline.
    Respond(Response<ProxyBody>),
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Flow::Next(req) => write!(f, "Next({} {})", req.method(), req.uri()),
            Flow::Respond(resp) => write!(f, "Respond({})", resp.status()),
        }
    }
}

/// Future returned by a middleware step.
pub type MiddlewareFuture<'a> = BoxFuture<'a, anyhow::Result<Flow>>;

/// A step of the host request pipeline.
///
/// Returning `Err` short-circuits into the host's error handling.
pub trait Middleware: Send + Sync {
    fn handle(&self, request: Request<ProxyBody>) -> MiddlewareFuture<'_>;
}

/// Adapter turning a plain function into a [`Middleware`].
pub struct MiddlewareFn<F>(F);

impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(Request<ProxyBody>) -> MiddlewareFuture<'static> + Send + Sync,
{
    fn handle(&self, request: Request<ProxyBody>) -> MiddlewareFuture<'_> {
        (self.0)(request)
    }
}

/// Wraps `func` so it can be registered on [`Middlewares`].
pub fn from_fn<F>(func: F) -> Arc<dyn Middleware>
where
    F: Fn(Request<ProxyBody>) -> MiddlewareFuture<'static> + Send + Sync + 'static,
{
    Arc::new(MiddlewareFn(func))
}

/// Ordered middleware pipeline of the host server.
#[derive(Clone, Default)]
pub struct Middlewares {
    stack: Vec<Arc<dyn Middleware>>,
}

impl Middlewares {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware; steps run in registration order.
    pub fn add(&mut self, middleware: Arc<dyn Middleware>) {
        self.stack.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Runs the request through every step until one responds.
    ///
    /// # Returns
    ///
    /// `Flow::Next` with the untouched request if nobody handled it, or the
    /// first error raised by a step.
    pub async fn run(&self, mut request: Request<ProxyBody>) -> anyhow::Result<Flow> {
        for (i, middleware) in self.stack.iter().enumerate() {
            match middleware.handle(request).await {
                Ok(Flow::Next(next)) => {
                    debug!("Middleware {} passed the request on", i);
                    request = next;
                }
                Ok(Flow::Respond(response)) => {
                    debug!("Middleware {} responded with {}", i, response.status());
                    return Ok(Flow::Respond(response));
                }
                Err(e) => {
                    error!("Middleware {} failed: {:#}", i, e);
                    return Err(e);
                }
            }
        }
        Ok(Flow::Next(request))
    }
}

impl std::fmt::Debug for Middlewares {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Middlewares")
            .field("len", &self.stack.len())
            .finish()
    }
}

//! Endpoint and middleware composition.
//!
//! An [`Endpoint`] turns a typed request into a typed response. A
//! [`Middleware`] turns an endpoint into another endpoint with the same
//! request and response types. Middlewares are declared outer-to-inner and
//! applied innermost first, so `compose([a, b]).wrap(h)` behaves as
//! `a(b(h))`.

mod logging;

pub use logging::LoggingMiddleware;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::auth::AuthClaims;
use crate::context::Context;
use crate::error::Result;

/// Future returned by [`Endpoint::handle`].
pub type EndpointFuture<'a, O> = Pin<Box<dyn Future<Output = Result<O>> + Send + 'a>>;

/// A typed request handler.
pub trait Endpoint<I, O, C = AuthClaims>: Send + Sync {
    fn handle(&self, ctx: Context<C>, input: I) -> EndpointFuture<'_, O>;
}

impl<I, O, C, F, Fut> Endpoint<I, O, C> for F
where
    F: Fn(Context<C>, I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    fn handle(&self, ctx: Context<C>, input: I) -> EndpointFuture<'_, O> {
        Box::pin(self(ctx, input))
    }
}

/// Shared, type-erased endpoint.
pub type BoxEndpoint<I, O, C = AuthClaims> = Arc<dyn Endpoint<I, O, C>>;

/// Box an async function as an endpoint.
pub fn endpoint_fn<I, O, C, F, Fut>(f: F) -> BoxEndpoint<I, O, C>
where
    F: Fn(Context<C>, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    Arc::new(f)
}

/// Wraps an endpoint with cross-cutting behavior.
pub trait Middleware<I, O, C = AuthClaims>: Send + Sync {
    fn wrap(&self, next: BoxEndpoint<I, O, C>) -> BoxEndpoint<I, O, C>;
}

impl<I, O, C, F> Middleware<I, O, C> for F
where
    F: Fn(BoxEndpoint<I, O, C>) -> BoxEndpoint<I, O, C> + Send + Sync,
{
    fn wrap(&self, next: BoxEndpoint<I, O, C>) -> BoxEndpoint<I, O, C> {
        self(next)
    }
}

/// Shared, type-erased middleware.
pub type BoxMiddleware<I, O, C = AuthClaims> = Arc<dyn Middleware<I, O, C>>;

struct Composed<I, O, C> {
    layers: Vec<BoxMiddleware<I, O, C>>,
}

impl<I, O, C> Middleware<I, O, C> for Composed<I, O, C> {
    fn wrap(&self, next: BoxEndpoint<I, O, C>) -> BoxEndpoint<I, O, C> {
        self.layers
            .iter()
            .rev()
            .fold(next, |inner, layer| layer.wrap(inner))
    }
}

/// Compose middlewares declared outer-to-inner into one middleware.
///
/// An empty list composes to the identity.
pub fn compose<I, O, C>(layers: Vec<BoxMiddleware<I, O, C>>) -> BoxMiddleware<I, O, C>
where
    I: 'static,
    O: 'static,
    C: 'static,
{
    Arc::new(Composed { layers })
}

/// `outer` followed by `others`, outermost first.
pub fn chain<I, O, C>(
    outer: BoxMiddleware<I, O, C>,
    others: impl IntoIterator<Item = BoxMiddleware<I, O, C>>,
) -> BoxMiddleware<I, O, C>
where
    I: 'static,
    O: 'static,
    C: 'static,
{
    let mut layers = vec![outer];
    layers.extend(others);
    compose(layers)
}

/// Collects middlewares in reading order and applies them to an endpoint.
///
/// ```ignore
/// let endpoint = ChainBuilder::new()
///     .layer(LoggingMiddleware::new("upload"))
///     .layer(JwtAuth::new(codec, keys))
///     .build(endpoint_fn(upload));
/// ```
pub struct ChainBuilder<I, O, C = AuthClaims> {
    layers: Vec<BoxMiddleware<I, O, C>>,
}

impl<I, O, C> ChainBuilder<I, O, C>
where
    I: 'static,
    O: 'static,
    C: 'static,
{
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Add a middleware inside the ones already added.
    pub fn layer(mut self, middleware: impl Middleware<I, O, C> + 'static) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Add an already shared middleware inside the ones already added.
    pub fn layer_boxed(mut self, middleware: BoxMiddleware<I, O, C>) -> Self {
        self.layers.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn into_middleware(self) -> BoxMiddleware<I, O, C> {
        compose(self.layers)
    }

    pub fn build(self, endpoint: BoxEndpoint<I, O, C>) -> BoxEndpoint<I, O, C> {
        self.into_middleware().wrap(endpoint)
    }
}

impl<I, O, C> Default for ChainBuilder<I, O, C>
where
    I: 'static,
    O: 'static,
    C: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

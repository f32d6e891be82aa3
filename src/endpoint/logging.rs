//! Request logging middleware.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info};

use super::{BoxEndpoint, Endpoint, EndpointFuture, Middleware};
use crate::context::Context;

/// Logs every invocation of the wrapped endpoint with its outcome and
/// duration. Failures that map to a 5xx status are logged at error level,
/// everything else at info.
#[derive(Debug, Clone)]
pub struct LoggingMiddleware {
    name: Arc<str>,
}

impl LoggingMiddleware {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }
}

impl<I, O, C> Middleware<I, O, C> for LoggingMiddleware
where
    I: Send + 'static,
    O: Send + 'static,
    C: Send + Sync + 'static,
{
    fn wrap(&self, next: BoxEndpoint<I, O, C>) -> BoxEndpoint<I, O, C> {
        Arc::new(LoggingEndpoint {
            name: self.name.clone(),
            next,
        })
    }
}

struct LoggingEndpoint<I, O, C> {
    name: Arc<str>,
    next: BoxEndpoint<I, O, C>,
}

impl<I, O, C> Endpoint<I, O, C> for LoggingEndpoint<I, O, C>
where
    I: Send + 'static,
    O: Send + 'static,
    C: Send + Sync + 'static,
{
    fn handle(&self, ctx: Context<C>, input: I) -> EndpointFuture<'_, O> {
        Box::pin(async move {
            let started = Instant::now();
            let request_id = ctx.request_id().map(str::to_owned);
            let result = self.next.handle(ctx, input).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &result {
                Ok(_) => info!(
                    endpoint = %self.name,
                    request_id = ?request_id,
                    elapsed_ms,
                    "request handled"
                ),
                Err(err) if err.status_code().is_server_error() => error!(
                    endpoint = %self.name,
                    request_id = ?request_id,
                    elapsed_ms,
                    error = %err,
                    "request failed"
                ),
                Err(err) => info!(
                    endpoint = %self.name,
                    request_id = ?request_id,
                    elapsed_ms,
                    status = err.status_code().as_u16(),
                    error = %err,
                    "request rejected"
                ),
            }

            result
        })
    }
}

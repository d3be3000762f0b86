use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::info;

use super::{Exchange, Middleware, Next};
use crate::error::Error;

/// Logs each request's method, path, status, protocol, client and duration.
///
/// Emits one `tracing::info!` record after the rest of the chain completes.
/// It never alters the request or the response.
pub struct RequestLogging;

impl Middleware for RequestLogging {
    fn exec<'a>(&'a self, exchange: Exchange, next: Next<'a>) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let start = Instant::now();
            let method = exchange.scope.method.clone();
            let path = exchange.scope.path.clone();
            let protocol = exchange.scope.kind;
            let client = exchange.scope.client.clone();
            let output = exchange.output.clone();

            let result = next.run(exchange).await;

            let status = output.status().map(|s| s.as_u16());
            info!(
                %method,
                %path,
                %protocol,
                client = client.as_deref().unwrap_or("-"),
                status,
                failed = result.is_err(),
                elapsed = ?start.elapsed(),
                "request processed"
            );
            result
        })
    }

    fn name(&self) -> &'static str {
        "RequestLogging"
    }
}

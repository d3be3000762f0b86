//! Middleware pipeline: composable before/after logic around the dispatcher.
//!
//! A [`Chain`] is built once by a [`ChainBuilder`] and is immutable after
//! that. Each call to [`ChainBuilder::add_middleware`] wraps everything added
//! so far, so the middleware added **last** is the outermost: requests enter
//! in reverse registration order and results unwind in registration order.
//!
//! Every middleware is written against one normalized [`Exchange`]
//! (scope, lazy body, response output), whichever transport the request
//! arrived on. Only the innermost node, the base [`App`], is terminal: it
//! dispatches and finalizes the response. Middleware that needs to see or
//! rewrite the response swaps in a capturing [`Output`].
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the rest of the chain; call [`Next::run`] to
//!   advance.
//! - [`Chain`] / [`ChainBuilder`]: the assembled pipeline.
//! - [`RequestLogging`], [`HandleError`]: built-in middleware.

mod error;
mod logging;

pub use self::error::HandleError;
pub use self::logging::RequestLogging;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{error, warn};

use crate::context::{BodyReader, Scope};
use crate::dispatch::{App, NormalizedResponse};
use crate::error::{Error, HttpError};
use crate::transport::{Output, Transport, TransportError};

/// The normalized request/response triple every middleware operates on.
#[derive(Debug)]
pub struct Exchange {
    pub scope: Scope,
    pub body: BodyReader,
    pub output: Output,
}

/// The core trait for all middleware.
///
/// Implementors receive an [`Exchange`] and a [`Next`] cursor. They may pass
/// the exchange through (`next.run(exchange).await`), enrich the scope first,
/// or run the rest of the chain against a capturing output and re-emit the
/// response afterwards.
///
/// # Contract
///
/// - A middleware that calls `next` must not also answer on the same output
///   unless nothing below it did ([`Output::is_finished`]).
/// - Errors returned from `exec` propagate outward to the next enclosing
///   middleware and finally to the transport boundary.
pub trait Middleware: Send + Sync {
    fn exec<'a>(&'a self, exchange: Exchange, next: Next<'a>) -> BoxFuture<'a, Result<(), Error>>;

    /// Name used in logs and in [`Chain::nodes`].
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A cursor into the remainder of the chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so each middleware can forward a
/// request at most once.
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    app: &'a App,
}

impl<'a> Next<'a> {
    /// Invokes the next middleware, or, at the end of the chain, dispatches
    /// to the base application and emits its response.
    pub async fn run(self, exchange: Exchange) -> Result<(), Error> {
        match self.rest.split_first() {
            Some((layer, rest)) => layer.exec(exchange, Next { rest, app: self.app }).await,
            None => {
                let Exchange {
                    scope,
                    body,
                    output,
                } = exchange;
                let response = self.app.dispatch(scope, body).await?;
                output.send_response(response).await?;
                Ok(())
            }
        }
    }
}

/// One node of a built chain, as reported by [`Chain::nodes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: &'static str,
    /// `true` for the node that finalizes the response: always the base app.
    pub is_terminal: bool,
    /// Index of the node wrapping this one, if any.
    pub parent: Option<usize>,
}

/// Assembles a [`Chain`] around a base [`App`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tandem::config::Settings;
/// use tandem::dispatch::App;
/// use tandem::middleware::{ChainBuilder, HandleError, RequestLogging};
/// use tandem::router::Router;
///
/// let app = App::new(Router::new(), Arc::new(Settings::default()));
/// let chain = ChainBuilder::new(app)
///     .add_middleware(HandleError)
///     .add_middleware(RequestLogging)
///     .build();
///
/// let nodes = chain.nodes();
/// assert_eq!(nodes.len(), 3);
/// assert!(nodes[0].is_terminal);
/// assert_eq!(nodes.iter().filter(|n| n.is_terminal).count(), 1);
/// ```
pub struct ChainBuilder {
    app: App,
    // Registration order; the last one is the outermost.
    layers: Vec<Arc<dyn Middleware>>,
}

impl ChainBuilder {
    pub fn new(app: App) -> Self {
        Self {
            app,
            layers: Vec::new(),
        }
    }

    /// Wraps the chain built so far in `middleware`.
    #[must_use]
    pub fn add_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    pub fn build(self) -> Chain {
        let count = self.layers.len();
        let mut nodes = Vec::with_capacity(count + 1);
        nodes.push(Node {
            name: "App",
            is_terminal: true,
            parent: (count > 0).then_some(1),
        });
        for (i, layer) in self.layers.iter().enumerate() {
            let index = i + 1;
            nodes.push(Node {
                name: layer.name(),
                is_terminal: false,
                parent: (index < count).then_some(index + 1),
            });
        }

        let mut layers = self.layers;
        layers.reverse();
        Chain {
            app: self.app,
            layers,
            nodes,
        }
    }
}

/// An immutable, built middleware chain.
pub struct Chain {
    app: App,
    // Outermost first.
    layers: Vec<Arc<dyn Middleware>>,
    nodes: Vec<Node>,
}

impl Chain {
    /// The nodes from the base app (index 0) outward.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    /// Runs one exchange through the chain.
    pub async fn exec(&self, exchange: Exchange) -> Result<(), Error> {
        Next {
            rest: &self.layers,
            app: &self.app,
        }
        .run(exchange)
        .await
    }

    /// Serves one request arriving on `transport`.
    ///
    /// The transport always receives exactly one terminating response: if the
    /// chain fails, panics, or returns without answering, an error response is
    /// emitted here.
    ///
    /// # Errors
    ///
    /// Only transport failures while writing the response.
    pub async fn handle(&self, mut scope: Scope, transport: Transport) -> Result<(), TransportError> {
        scope.kind = transport.kind();
        let (body, output) = transport.into_parts(self.app.settings().response_chunk_size);
        let exchange = Exchange {
            scope,
            body,
            output: output.clone(),
        };

        let result = match AssertUnwindSafe(self.exec(exchange)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = self::error::panic_message(panic.as_ref());
                error!(panic = %message, "chain panicked");
                Err(Error::internal(message))
            }
        };
        let response = match result {
            Ok(()) if output.is_finished() => return Ok(()),
            Ok(()) => {
                warn!("chain returned without responding");
                NormalizedResponse::from_error(
                    &HttpError::internal_server_error().with_detail("No response generated"),
                )
            }
            Err(err) if output.is_finished() => {
                error!(error = ?err, "chain failed after responding");
                return Ok(());
            }
            Err(err) => error_response(&err),
        };
        output.send_response(response).await
    }
}

/// The `{"detail": ...}` response for any chain failure.
pub(crate) fn error_response(err: &Error) -> NormalizedResponse {
    match err {
        Error::Http(http) => NormalizedResponse::from_error(http),
        other => NormalizedResponse::from_error(
            &HttpError::internal_server_error().with_detail(format!("Internal Server Error: {other}")),
        ),
    }
}

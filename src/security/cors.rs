use futures::future::BoxFuture;
use tracing::debug;

use crate::config::Settings;
use crate::error::Error;
use crate::http::Headers;
use crate::middleware::{Exchange, Middleware, Next};

/// CORS middleware that decorates responses for whitelisted client hosts.
///
/// The rest of the chain runs against a capturing output, so nothing reaches
/// the wire until it has finished. If the client's host is whitelisted, the
/// CORS headers are merged into the captured headers; the response is then
/// re-emitted through the real transport either way.
///
/// A whitelist entry admits a client when it contains the client's host
/// (`"127.0.0.1:3000"` admits `127.0.0.1`), or when it is `"*"`.
///
/// | Header                           | Default                           |
/// |----------------------------------|-----------------------------------|
/// | `access-control-allow-origin`    | `*`                               |
/// | `access-control-allow-methods`   | `GET, POST, PUT, DELETE, OPTIONS` |
/// | `access-control-allow-headers`   | `Content-Type, Authorization`     |
///
/// # Examples
///
/// ```rust
/// use tandem::security::Cors;
///
/// let cors = Cors::new(["127.0.0.1", "10.0.0.7"]).allow_header("X-Request-ID");
/// assert!(cors.admits(Some("127.0.0.1")));
/// assert!(!cors.admits(Some("192.168.0.1")));
/// assert!(!cors.admits(None));
/// ```
pub struct Cors {
    whitelist: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
}

impl Cors {
    pub fn new<I, S>(whitelist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            whitelist: whitelist.into_iter().map(Into::into).collect(),
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .map(str::to_owned)
                .to_vec(),
            allowed_headers: ["Content-Type", "Authorization"].map(str::to_owned).to_vec(),
        }
    }

    /// A CORS layer over `settings.cors_whitelist`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.cors_whitelist.iter().cloned())
    }

    #[must_use]
    pub fn allow_method(mut self, method: impl Into<String>) -> Self {
        self.allowed_methods.push(method.into());
        self
    }

    #[must_use]
    pub fn allow_header(mut self, header: impl Into<String>) -> Self {
        self.allowed_headers.push(header.into());
        self
    }

    /// Whether a client at `host` gets CORS headers.
    pub fn admits(&self, host: Option<&str>) -> bool {
        let Some(host) = host.filter(|h| !h.is_empty()) else {
            return false;
        };
        self.whitelist
            .iter()
            .any(|entry| entry == "*" || entry.contains(host))
    }

    fn headers(&self) -> Headers {
        [
            ("access-control-allow-origin", "*".to_owned()),
            ("access-control-allow-methods", self.allowed_methods.join(", ")),
            ("access-control-allow-headers", self.allowed_headers.join(", ")),
        ]
        .into_iter()
        .collect()
    }
}

impl Middleware for Cors {
    fn exec<'a>(&'a self, exchange: Exchange, next: Next<'a>) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let admitted = self.admits(exchange.scope.client_host());
            let real = exchange.output.clone();
            let (shim, capture) = real.capture();

            next.run(Exchange {
                output: shim,
                ..exchange
            })
            .await?;

            let Some(mut response) = capture.take() else {
                return Ok(());
            };
            if admitted {
                response.headers_mut().merge(&self.headers());
            }
            debug!(admitted, status = %response.status(), "re-emitting captured response");
            real.send_response(response).await?;
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "Cors"
    }
}

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use super::{Exchange, Middleware, Next, error_response};
use crate::error::Error;

/// Failure boundary around the rest of the chain.
///
/// HTTP errors become `{"detail": message}` with their own status. Anything
/// else, panics included, is logged and answered with a 500 whose detail
/// embeds the error text.
///
/// Register it late (outermost) so it also sees routing failures and errors
/// raised by other middleware.
pub struct HandleError;

impl Middleware for HandleError {
    fn exec<'a>(&'a self, exchange: Exchange, next: Next<'a>) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let output = exchange.output.clone();
            let err = match AssertUnwindSafe(next.run(exchange)).catch_unwind().await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => err,
                Err(panic) => Error::internal(panic_message(panic.as_ref())),
            };

            match &err {
                Error::Http(http) if http.status().is_server_error() => {
                    warn!(status = %http.status(), detail = http.detail(), "request failed")
                }
                Error::Http(http) => debug!(status = %http.status(), detail = http.detail(), "request failed"),
                other => error!(error = ?other, "unhandled failure"),
            }

            if output.is_finished() {
                error!("response already sent, dropping error");
                return Ok(());
            }
            output.send_response(error_response(&err)).await?;
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "HandleError"
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;

    use super::*;
    use crate::config::Settings;
    use crate::context::Scope;
    use crate::dispatch::{App, Reply};
    use crate::error::HttpError;
    use crate::http::{Headers, Method, StatusCode};
    use crate::middleware::ChainBuilder;
    use crate::router::Router;
    use crate::transport::{Protocol, ProtocolKind, Transport, TransportError};

    #[derive(Default)]
    struct Recorded(Mutex<Vec<(StatusCode, Bytes)>>);

    impl Protocol for Recorded {
        fn body(&self) -> BoxFuture<'_, Result<Bytes, TransportError>> {
            Box::pin(async { Ok(Bytes::new()) })
        }

        fn respond(&self, status: StatusCode, _headers: Headers, body: Bytes) -> Result<(), TransportError> {
            self.0.lock().unwrap().push((status, body));
            Ok(())
        }
    }

    async fn serve(path: &str) -> Vec<(StatusCode, Bytes)> {
        let mut router = Router::new();
        router
            .get("/conflict/", |_ctx| async {
                Err(Error::from(HttpError::conflict().with_detail("Login já registrado")))
            })
            .unwrap();
        router
            .get("/io/", |_ctx| async {
                Err(Error::internal(std::io::Error::other("disk on fire")))
            })
            .unwrap();
        router
            .get("/panic/", |_ctx| async {
                if true {
                    panic!("boom");
                }
                Ok(Reply::new(StatusCode::Ok))
            })
            .unwrap();
        let app = App::new(router, Arc::new(Settings::default()));
        let chain = ChainBuilder::new(app).add_middleware(HandleError).build();

        let protocol = Arc::new(Recorded::default());
        chain
            .handle(
                Scope::new(ProtocolKind::SingleShot, Method::Get, path),
                Transport::single_shot(protocol.clone()),
            )
            .await
            .unwrap();
        let recorded = protocol.0.lock().unwrap().clone();
        recorded
    }

    #[tokio::test]
    async fn http_errors_keep_their_status() {
        let sent = serve("/conflict/").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, StatusCode::Conflict);
        let body: serde_json::Value = serde_json::from_slice(&sent[0].1).unwrap();
        assert_eq!(body, serde_json::json!({"detail": "Login já registrado"}));
    }

    #[tokio::test]
    async fn other_errors_become_500_with_the_message() {
        let sent = serve("/io/").await;
        assert_eq!(sent[0].0, StatusCode::InternalServerError);
        assert_eq!(sent[0].1, r#"{"detail":"Internal Server Error: disk on fire"}"#);
    }

    #[tokio::test]
    async fn panics_become_500() {
        let sent = serve("/panic/").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, StatusCode::InternalServerError);
        assert_eq!(sent[0].1, r#"{"detail":"Internal Server Error: boom"}"#);
    }

    #[tokio::test]
    async fn routing_failures_are_translated() {
        let sent = serve("/conflict/extra/").await;
        assert_eq!(sent[0].0, StatusCode::NotFound);
    }
}

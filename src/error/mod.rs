//! Error taxonomy shared by the router, dispatcher and middleware.
//!
//! [`HttpError`] is the typed failure every business handler raises: a status
//! plus a human-readable `detail`, serialized on the wire as
//! `{"detail": "<message>"}`. [`Error`] is what travels up the middleware
//! chain; the error-handling middleware turns it into a response.

use serde_json::json;
use thiserror::Error;

use crate::http::StatusCode;
use crate::transport::TransportError;

/// An HTTP failure carrying a status and a detail message.
///
/// Every constructor starts from the status' canonical reason as the default
/// detail; [`with_detail`](Self::with_detail) overrides it at the raise site.
///
/// # Examples
///
/// ```
/// use tandem::error::HttpError;
/// use tandem::http::StatusCode;
///
/// let err = HttpError::not_found();
/// assert_eq!(err.status(), StatusCode::NotFound);
/// assert_eq!(err.detail(), "Not Found");
///
/// let err = HttpError::conflict().with_detail("Login already exists");
/// assert_eq!(err.body().to_string(), r#"{"detail":"Login already exists"}"#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}: {detail}")]
pub struct HttpError {
    status: StatusCode,
    detail: String,
}

impl HttpError {
    /// Creates an error with the status' default detail.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            detail: status.canonical_reason().to_owned(),
        }
    }

    /// Replaces the detail message.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// The JSON body sent to the client.
    pub fn body(&self) -> serde_json::Value {
        json!({ "detail": self.detail })
    }

    pub fn bad_request() -> Self {
        Self::new(StatusCode::BadRequest)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::Unauthorized)
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::Forbidden)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NotFound)
    }

    pub fn method_not_allowed() -> Self {
        Self::new(StatusCode::MethodNotAllowed)
    }

    pub fn conflict() -> Self {
        Self::new(StatusCode::Conflict)
    }

    pub fn gone() -> Self {
        Self::new(StatusCode::Gone)
    }

    pub fn unprocessable_entity() -> Self {
        Self::new(StatusCode::UnprocessableEntity)
    }

    pub fn too_many_requests() -> Self {
        Self::new(StatusCode::TooManyRequests)
    }

    pub fn internal_server_error() -> Self {
        Self::new(StatusCode::InternalServerError)
    }

    pub fn not_implemented() -> Self {
        Self::new(StatusCode::NotImplemented)
    }

    pub fn bad_gateway() -> Self {
        Self::new(StatusCode::BadGateway)
    }

    pub fn service_unavailable() -> Self {
        Self::new(StatusCode::ServiceUnavailable)
    }

    pub fn gateway_timeout() -> Self {
        Self::new(StatusCode::GatewayTimeout)
    }
}

/// A failure travelling up the middleware chain.
#[derive(Debug, Error)]
pub enum Error {
    /// A typed HTTP failure (routing, coercion or business-raised).
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The transport failed to deliver the body or accept the response.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Anything else; reported to the client as a 500.
    #[error("{0}")]
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error (or message) as an uncaught failure.
    pub fn internal(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Internal(err.into())
    }
}

/// Convenience alias used by handlers and middleware.
pub type Result<T, E = Error> = std::result::Result<T, E>;

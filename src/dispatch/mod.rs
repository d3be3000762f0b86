//! Request dispatch: from normalized request data to a normalized response.
//!
//! [`App`] is the innermost node of every middleware chain. For each request
//! it parses the query string, resolves the handler through the [`Router`],
//! coerces declared query parameters, invokes the handler with a
//! [`RequestContext`] and normalizes what comes back.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::context::{BodyReader, Params, RequestContext, Scope};
use crate::error::{Error, HttpError};
use crate::http::{Headers, StatusCode};
use crate::router::Router;

/// What a handler returns: status, body and headers.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tandem::dispatch::Reply;
/// use tandem::http::StatusCode;
///
/// let reply = Reply::json(json!({"id": 1}))
///     .with_status(StatusCode::Created)
///     .header("Location", "/items/1");
/// assert_eq!(reply.status_code(), StatusCode::Created);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    status: StatusCode,
    body: serde_json::Value,
    headers: Headers,
}

impl Reply {
    /// A reply with `status` and no body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            body: serde_json::Value::Null,
            headers: Headers::new(),
        }
    }

    /// A `200 OK` carrying `body`.
    pub fn json(body: serde_json::Value) -> Self {
        Self {
            body,
            ..Self::new(StatusCode::Ok)
        }
    }

    /// A `200 OK` carrying `body` serialized to JSON.
    pub fn serialize<T: Serialize + ?Sized>(body: &T) -> Result<Self, Error> {
        serde_json::to_value(body)
            .map(Self::json)
            .map_err(Error::internal)
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }
}

impl From<(StatusCode, serde_json::Value, Headers)> for Reply {
    fn from((status, body, headers): (StatusCode, serde_json::Value, Headers)) -> Self {
        Self {
            status,
            body,
            headers,
        }
    }
}

/// A transport-agnostic response.
///
/// A `204 No Content` never carries a body, whatever was supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedResponse {
    status: StatusCode,
    body: serde_json::Value,
    headers: Headers,
}

impl NormalizedResponse {
    pub fn new(status: StatusCode, body: serde_json::Value, headers: Headers) -> Self {
        let body = if status.permits_body() {
            body
        } else {
            serde_json::Value::Null
        };
        Self {
            status,
            body,
            headers,
        }
    }

    /// The `{"detail": ...}` response for an HTTP failure.
    pub fn from_error(err: &HttpError) -> Self {
        Self::new(err.status(), err.body(), Headers::new())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Encodes the response for a transport. A `null` body is sent as no
    /// bytes at all; anything else as JSON with `Content-Type:
    /// application/json` unless the handler chose a content type.
    pub fn into_wire(self) -> (StatusCode, Headers, Bytes) {
        let mut headers = self.headers;
        let body = match self.body {
            serde_json::Value::Null => Bytes::new(),
            value => {
                if !headers.contains("content-type") {
                    headers.insert("content-type", "application/json");
                }
                Bytes::from(value.to_string())
            }
        };
        (self.status, headers, body)
    }
}

impl From<Reply> for NormalizedResponse {
    fn from(reply: Reply) -> Self {
        Self::new(reply.status, reply.body, reply.headers)
    }
}

/// Parses a query string into a flat map; the first non-blank value wins for
/// repeated keys and blank values are dropped. An undecodable query string
/// yields an empty map.
pub fn parse_query_string(query: &str) -> BTreeMap<String, String> {
    let pairs: Vec<(String, String)> = match serde_urlencoded::from_str(query) {
        Ok(pairs) => pairs,
        Err(e) => {
            warn!(error = %e, query, "ignoring undecodable query string");
            return BTreeMap::new();
        }
    };

    let mut map = BTreeMap::new();
    for (key, value) in pairs.into_iter().filter(|(_, value)| !value.is_empty()) {
        map.entry(key).or_insert(value);
    }
    map
}

/// The base application: router plus settings.
pub struct App {
    router: Arc<Router>,
    settings: Arc<Settings>,
}

impl App {
    pub fn new(router: Router, settings: Arc<Settings>) -> Self {
        Self {
            router: Arc::new(router),
            settings,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Dispatches one request.
    ///
    /// # Errors
    ///
    /// - 404 "Route not Found" when no route fits the path.
    /// - 405 when the path fits but the method does not.
    /// - 422 when a path or declared query parameter fails coercion.
    /// - anything the handler raises.
    pub async fn dispatch(&self, scope: Scope, body: BodyReader) -> Result<NormalizedResponse, Error> {
        let query = parse_query_string(&scope.query_string);

        let matched = self
            .router
            .resolve(&scope.method, &scope.path)?
            .ok_or_else(|| HttpError::not_found().with_detail("Route not Found"))?;
        debug!(
            method = %scope.method,
            path = %scope.path,
            route = matched.template(),
            "route resolved"
        );

        let query_params = match matched.query_validator() {
            Some(validator) => validator.validate(&query)?,
            None => Params::new(),
        };

        let ctx = RequestContext::new(scope, matched.params, query, query_params, body);
        let reply = (matched.handler)(ctx).await?;
        Ok(reply.into())
    }
}

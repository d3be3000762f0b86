//! Per-request state handed through the middleware chain and into handlers.
//!
//! - [`Scope`]: transport-agnostic request metadata, including the identity
//!   resolved by the authentication middleware.
//! - [`BodyReader`]: a deferred, read-at-most-once accessor for the body.
//! - [`Params`]: typed values extracted from the path or coerced from the
//!   query string.
//! - [`RequestContext`]: what a handler receives.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;

use crate::error::{Error, HttpError};
use crate::http::{Headers, Method};
use crate::router::value::{FromValue, Value};
use crate::transport::{ProtocolKind, TransportError};
use crate::validate::ParamsValidator;

/// Typed parameters keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Params {
    map: HashMap<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.map.insert(name.into(), value);
    }

    /// The raw [`Value`] stored under `name`.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.map.get(name)
    }

    /// Extracts `name` as `T`.
    ///
    /// # Errors
    ///
    /// A 422 [`HttpError`] when the parameter is absent or holds another type.
    pub fn get<T: FromValue>(&self, name: &str) -> Result<T, HttpError> {
        self.map
            .get(name)
            .and_then(T::from_value)
            .ok_or_else(|| {
                HttpError::unprocessable_entity()
                    .with_detail(format!("parameter `{name}` is missing or has the wrong type"))
            })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// An authenticated caller, as resolved from the `Authorization` header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub id: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            claims: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }
}

/// Transport-agnostic request metadata.
///
/// Built once at the transport boundary and passed by value down the chain;
/// middleware may enrich it (e.g. `current_user`) before handing it inward.
#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ProtocolKind,
    pub method: Method,
    pub path: String,
    pub query_string: String,
    pub headers: Headers,
    /// Peer address as reported by the transport (`host` or `host:port`).
    pub client: Option<String>,
    pub current_user: Option<Identity>,
}

impl Scope {
    pub fn new(kind: ProtocolKind, method: Method, path: impl Into<String>) -> Self {
        Self {
            kind,
            method,
            path: path.into(),
            query_string: String::new(),
            headers: Headers::new(),
            client: None,
            current_user: None,
        }
    }

    #[must_use]
    pub fn with_query(mut self, query_string: impl Into<String>) -> Self {
        self.query_string = query_string.into();
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    /// The client's host with any `:port` suffix removed.
    pub fn client_host(&self) -> Option<&str> {
        let client = self.client.as_deref()?;
        if let Some(rest) = client.strip_prefix('[') {
            return rest.split(']').next();
        }
        match client.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
                Some(host)
            }
            _ => Some(client),
        }
    }
}

/// Something that can produce the whole request body once.
pub trait BodySource: Send {
    fn read_all(self: Box<Self>) -> BoxFuture<'static, Result<Bytes, TransportError>>;
}

impl BodySource for Bytes {
    fn read_all(self: Box<Self>) -> BoxFuture<'static, Result<Bytes, TransportError>> {
        Box::pin(async move { Ok(*self) })
    }
}

struct BodyState {
    source: Mutex<Option<Box<dyn BodySource>>>,
    bytes: OnceCell<Bytes>,
}

/// Deferred access to the request body.
///
/// The underlying source is pulled at most once, on the first call to
/// [`read`](Self::read); later calls return the cached bytes. A handler that
/// never asks for the body never touches the transport's body machinery.
#[derive(Clone)]
pub struct BodyReader {
    state: Arc<BodyState>,
}

impl BodyReader {
    pub fn new(source: impl BodySource + 'static) -> Self {
        Self {
            state: Arc::new(BodyState {
                source: Mutex::new(Some(Box::new(source))),
                bytes: OnceCell::new(),
            }),
        }
    }

    /// A reader over an empty body.
    pub fn empty() -> Self {
        Self::new(Bytes::new())
    }

    /// Returns the body, pulling it from the transport on first use.
    ///
    /// # Errors
    ///
    /// Whatever the transport reports while delivering the body.
    pub async fn read(&self) -> Result<Bytes, TransportError> {
        self.state
            .bytes
            .get_or_try_init(|| async {
                let source = self
                    .state
                    .source
                    .lock()
                    .map_err(|_| TransportError::BodyUnavailable)?
                    .take();
                match source {
                    Some(source) => source.read_all().await,
                    None => Err(TransportError::BodyUnavailable),
                }
            })
            .await
            .cloned()
    }

    /// `true` once the body has been pulled from the transport.
    pub fn is_read(&self) -> bool {
        self.state.bytes.initialized()
    }
}

impl std::fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyReader")
            .field("read", &self.is_read())
            .finish()
    }
}

/// Everything a handler gets to look at for one request.
pub struct RequestContext {
    scope: Scope,
    params: Params,
    query: BTreeMap<String, String>,
    query_params: Params,
    body: BodyReader,
}

impl RequestContext {
    pub fn new(
        scope: Scope,
        params: Params,
        query: BTreeMap<String, String>,
        query_params: Params,
        body: BodyReader,
    ) -> Self {
        Self {
            scope,
            params,
            query,
            query_params,
            body,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn method(&self) -> &Method {
        &self.scope.method
    }

    pub fn path(&self) -> &str {
        &self.scope.path
    }

    pub fn headers(&self) -> &Headers {
        &self.scope.headers
    }

    /// Path parameters captured by the route template, already typed.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Shorthand for `self.params().get(name)`.
    pub fn param<T: FromValue>(&self, name: &str) -> Result<T, HttpError> {
        self.params.get(name)
    }

    /// The flat query map; the first value wins for repeated keys.
    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    /// Query values coerced by the endpoint's declared validator.
    pub fn query_params(&self) -> &Params {
        &self.query_params
    }

    pub fn current_user(&self) -> Option<&Identity> {
        self.scope.current_user.as_ref()
    }

    /// The authenticated caller, or a 401.
    pub fn require_user(&self) -> Result<&Identity, HttpError> {
        self.current_user().ok_or_else(HttpError::unauthorized)
    }

    /// The raw body bytes.
    pub async fn body(&self) -> Result<Bytes, Error> {
        Ok(self.body.read().await?)
    }

    /// The body parsed as JSON, or `None` when it is empty.
    ///
    /// # Errors
    ///
    /// A 422 when the body is not valid JSON.
    pub async fn body_json(&self) -> Result<Option<serde_json::Value>, Error> {
        let bytes = self.body().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            HttpError::unprocessable_entity()
                .with_detail(format!("Invalid JSON body: {e}"))
                .into()
        })
    }

    /// The body deserialized into `T`.
    pub async fn body_as<T: DeserializeOwned>(&self) -> Result<T, Error> {
        let bytes = self.body().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            HttpError::unprocessable_entity()
                .with_detail(format!("Invalid JSON body: {e}"))
                .into()
        })
    }

    /// The body checked field-by-field against `validator`.
    ///
    /// # Errors
    ///
    /// A 422 when the body is empty or not a JSON object ("Must be a dict"),
    /// or carrying the failing field's configured message.
    pub async fn body_validated(&self, validator: &ParamsValidator) -> Result<Params, Error> {
        match self.body_json().await? {
            Some(serde_json::Value::Object(map)) => Ok(validator.validate_json(&map)?),
            _ => Err(HttpError::unprocessable_entity()
                .with_detail("Must be a dict")
                .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::router::value::ParamType;

    struct Counting(Arc<AtomicUsize>, &'static [u8]);

    impl BodySource for Counting {
        fn read_all(self: Box<Self>) -> BoxFuture<'static, Result<Bytes, TransportError>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            let data = Bytes::from_static(self.1);
            Box::pin(async move { Ok(data) })
        }
    }

    fn ctx_with_body(body: &'static [u8]) -> RequestContext {
        RequestContext::new(
            Scope::new(ProtocolKind::SingleShot, Method::Post, "/"),
            Params::new(),
            BTreeMap::new(),
            Params::new(),
            BodyReader::new(Bytes::from_static(body)),
        )
    }

    #[tokio::test]
    async fn body_source_is_pulled_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reader = BodyReader::new(Counting(calls.clone(), b"abc"));
        assert!(!reader.is_read());
        assert_eq!(reader.read().await.unwrap(), "abc");
        assert_eq!(reader.clone().read().await.unwrap(), "abc");
        assert!(reader.is_read());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unread_body_never_touches_the_source() {
        let calls = Arc::new(AtomicUsize::new(0));
        let reader = BodyReader::new(Counting(calls.clone(), b"abc"));
        drop(reader);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_body_is_no_json() {
        assert_eq!(ctx_with_body(b"").body_json().await.unwrap(), None);
        let err = ctx_with_body(b"{oops").body_json().await.unwrap_err();
        assert!(matches!(err, Error::Http(e) if e.status().as_u16() == 422));
    }

    #[tokio::test]
    async fn validated_body_requires_an_object() {
        let validator = ParamsValidator::new().field("user_id", ParamType::Int, "user_id required");
        let err = ctx_with_body(b"[1]").body_validated(&validator).await.unwrap_err();
        assert!(matches!(err, Error::Http(e) if e.detail() == "Must be a dict"));

        let params = ctx_with_body(br#"{"user_id": "10"}"#)
            .body_validated(&validator)
            .await
            .unwrap();
        assert_eq!(params.get::<i64>("user_id").unwrap(), 10);
    }

    #[test]
    fn client_host_strips_ports() {
        let scope = Scope::new(ProtocolKind::Streaming, Method::Get, "/");
        assert_eq!(scope.client_host(), None);
        assert_eq!(scope.clone().with_client("10.0.0.2:5123").client_host(), Some("10.0.0.2"));
        assert_eq!(scope.clone().with_client("localhost").client_host(), Some("localhost"));
        assert_eq!(scope.with_client("[::1]:80").client_host(), Some("::1"));
    }

    #[test]
    fn require_user_is_401_without_identity() {
        let ctx = ctx_with_body(b"");
        assert_eq!(ctx.require_user().unwrap_err().status().as_u16(), 401);
    }
}

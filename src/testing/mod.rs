//! In-process test client.
//!
//! [`TestClient`] drives a built [`Chain`] over in-memory transports of either
//! shape, without opening sockets, and collects what the chain emitted into a
//! [`TestResponse`].
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use tandem::config::Settings;
//! use tandem::dispatch::{App, Reply};
//! use tandem::http::StatusCode;
//! use tandem::middleware::ChainBuilder;
//! use tandem::router::Router;
//! use tandem::testing::TestClient;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut router = Router::new();
//! router.get("/ping/", |_ctx| async { Ok(Reply::json(json!("pong"))) }).unwrap();
//! let chain = ChainBuilder::new(App::new(router, Arc::new(Settings::default()))).build();
//!
//! let client = TestClient::new(chain);
//! let response = client.get("/ping/").send().await;
//! assert_eq!(response.status(), StatusCode::Ok);
//! assert_eq!(response.json::<String>().unwrap(), "pong");
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::Scope;
use crate::http::{Headers, Method, StatusCode};
use crate::middleware::Chain;
use crate::transport::{Chunk, Message, Protocol, ProtocolKind, Receive, Sender, Transport, TransportError};

/// Sends requests straight into a [`Chain`].
pub struct TestClient {
    chain: Arc<Chain>,
    kind: ProtocolKind,
    client: String,
}

impl TestClient {
    /// A client using the transport shape from the chain's settings.
    pub fn new(chain: Chain) -> Self {
        let kind = chain.app().settings().protocol;
        Self {
            chain: Arc::new(chain),
            kind,
            client: "127.0.0.1:50000".to_owned(),
        }
    }

    /// Use the streaming transport.
    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.kind = ProtocolKind::Streaming;
        self
    }

    /// Use the single-shot transport.
    #[must_use]
    pub fn single_shot(mut self) -> Self {
        self.kind = ProtocolKind::SingleShot;
        self
    }

    /// Peer address reported for every request.
    #[must_use]
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    pub fn get(&self, path: &str) -> RequestBuilder<'_> {
        self.request(Method::Get, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder<'_> {
        self.request(Method::Post, path)
    }

    pub fn put(&self, path: &str) -> RequestBuilder<'_> {
        self.request(Method::Put, path)
    }

    pub fn patch(&self, path: &str) -> RequestBuilder<'_> {
        self.request(Method::Patch, path)
    }

    pub fn delete(&self, path: &str) -> RequestBuilder<'_> {
        self.request(Method::Delete, path)
    }

    pub fn options(&self, path: &str) -> RequestBuilder<'_> {
        self.request(Method::Options, path)
    }

    /// A request with `method`. `path` may carry a `?query`.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder<'_> {
        let (path, query) = path.split_once('?').unwrap_or((path, ""));
        RequestBuilder {
            client: self,
            method,
            path: path.to_owned(),
            query: query.to_owned(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }
}

/// A request under construction.
pub struct RequestBuilder<'a> {
    client: &'a TestClient,
    method: Method,
    path: String,
    query: String,
    headers: Headers,
    body: Bytes,
}

impl RequestBuilder<'_> {
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Serializes `value` as the JSON body.
    ///
    /// # Panics
    ///
    /// Panics if `value` fails to serialize.
    #[must_use]
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        let body = serde_json::to_vec(value).expect("test body must serialize");
        self.headers.set("content-type", "application/json");
        self.body = Bytes::from(body);
        self
    }

    /// Runs the request through the chain.
    ///
    /// # Panics
    ///
    /// Panics if the chain fails to produce a response.
    pub async fn send(self) -> TestResponse {
        let client = self.client;
        let scope = Scope::new(client.kind, self.method, self.path)
            .with_query(self.query)
            .with_headers(self.headers)
            .with_client(client.client.clone());
        let chunk_size = client.chain.app().settings().response_chunk_size;

        match client.kind {
            ProtocolKind::SingleShot => {
                let protocol = Arc::new(MemoryProtocol::new(self.body));
                client
                    .chain
                    .handle(scope, Transport::single_shot(protocol.clone()))
                    .await
                    .expect("chain must respond");
                protocol.into_response()
            }
            ProtocolKind::Streaming => {
                let pulled = Arc::new(AtomicBool::new(false));
                let receive = MemoryReceive::new(self.body, chunk_size, Arc::clone(&pulled));
                let recorder = Arc::new(MemorySender::default());
                client
                    .chain
                    .handle(scope, Transport::streaming(receive, recorder.clone()))
                    .await
                    .expect("chain must respond");
                recorder.into_response(pulled.load(Ordering::SeqCst))
            }
        }
    }
}

/// What the chain emitted for one request.
#[derive(Debug, Clone)]
pub struct TestResponse {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    frames: usize,
    body_pulled: bool,
}

impl TestResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    /// The body as UTF-8, or `""` if it is not valid UTF-8.
    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or("")
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Body messages sent on a streaming transport; 0 for single-shot.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Whether anything asked the transport for the request body.
    pub fn body_pulled(&self) -> bool {
        self.body_pulled
    }
}

struct MemoryProtocol {
    body: Bytes,
    pulled: AtomicBool,
    response: Mutex<Option<(StatusCode, Headers, Bytes)>>,
}

impl MemoryProtocol {
    fn new(body: Bytes) -> Self {
        Self {
            body,
            pulled: AtomicBool::new(false),
            response: Mutex::new(None),
        }
    }

    fn into_response(&self) -> TestResponse {
        let (status, headers, body) = self
            .response
            .lock()
            .expect("response lock")
            .take()
            .expect("chain must respond");
        TestResponse {
            status,
            headers,
            body,
            frames: 0,
            body_pulled: self.pulled.load(Ordering::SeqCst),
        }
    }
}

impl Protocol for MemoryProtocol {
    fn body(&self) -> BoxFuture<'_, Result<Bytes, TransportError>> {
        self.pulled.store(true, Ordering::SeqCst);
        let body = self.body.clone();
        Box::pin(async move { Ok(body) })
    }

    fn respond(&self, status: StatusCode, headers: Headers, body: Bytes) -> Result<(), TransportError> {
        let mut slot = self.response.lock().map_err(|_| TransportError::AlreadyResponded)?;
        if slot.is_some() {
            return Err(TransportError::AlreadyResponded);
        }
        *slot = Some((status, headers, body));
        Ok(())
    }
}

struct MemoryReceive {
    chunks: VecDeque<Bytes>,
    done: bool,
    pulled: Arc<AtomicBool>,
}

impl MemoryReceive {
    fn new(mut body: Bytes, chunk_size: usize, pulled: Arc<AtomicBool>) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut chunks = VecDeque::new();
        while !body.is_empty() {
            chunks.push_back(body.split_to(body.len().min(chunk_size)));
        }
        Self {
            chunks,
            done: false,
            pulled,
        }
    }
}

impl Receive for MemoryReceive {
    fn receive(&mut self) -> BoxFuture<'_, Result<Chunk, TransportError>> {
        self.pulled.store(true, Ordering::SeqCst);
        let next = if self.done {
            Err(TransportError::Disconnected)
        } else {
            let data = self.chunks.pop_front().unwrap_or_default();
            let more = !self.chunks.is_empty();
            self.done = !more;
            Ok(Chunk { data, more })
        };
        Box::pin(async move { next })
    }
}

#[derive(Default)]
struct MemorySender {
    messages: Mutex<Vec<Message>>,
}

impl MemorySender {
    fn into_response(&self, body_pulled: bool) -> TestResponse {
        let messages = std::mem::take(&mut *self.messages.lock().expect("messages lock"));
        let mut iter = messages.into_iter();
        let Some(Message::Start { status, headers }) = iter.next() else {
            panic!("streaming response must open with a start message");
        };

        let mut body = BytesMut::new();
        let mut frames = 0;
        let mut finished = false;
        for message in iter {
            match message {
                Message::Body { data, more_body } => {
                    assert!(!finished, "body frame after the final one");
                    body.extend_from_slice(&data);
                    frames += 1;
                    finished = !more_body;
                }
                Message::Start { .. } => panic!("second start message"),
            }
        }
        assert!(finished, "streaming response was never terminated");

        TestResponse {
            status,
            headers,
            body: body.freeze(),
            frames,
            body_pulled,
        }
    }
}

impl Sender for MemorySender {
    fn send(&self, message: Message) -> BoxFuture<'_, Result<(), TransportError>> {
        let result = self
            .messages
            .lock()
            .map(|mut messages| messages.push(message))
            .map_err(|_| TransportError::Disconnected);
        Box::pin(async move { result })
    }
}

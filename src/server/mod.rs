//! Async TCP server using Tokio.
//!
//! Accepts TCP connections, parses HTTP/1.1 requests and serves each one
//! through a middleware [`Chain`]. Every connection is adapted to the
//! transport shape selected by `Settings::protocol`:
//!
//! - **single-shot**: the buffered body is handed over in one call and the
//!   response is written as one fixed-length message;
//! - **streaming**: the body is delivered in `response_chunk_size` pieces and
//!   the response is written with `Transfer-Encoding: chunked`, one chunk per
//!   body message.
//!
//! Persistent connections (keep-alive) are supported for both.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::context::Scope;
use crate::error::HttpError;
use crate::http::response::{LAST_CHUNK, encode_chunk};
use crate::http::{Headers, Request, Response, StatusCode, request::RequestError};
use crate::middleware::Chain;
use crate::transport::{Chunk, Message, Protocol, ProtocolKind, Receive, Sender, Transport, TransportError};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The TCP front end.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tandem::config::Settings;
/// use tandem::dispatch::App;
/// use tandem::middleware::{ChainBuilder, HandleError};
/// use tandem::router::Router;
/// use tandem::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let settings = Arc::new(Settings::default());
///     let app = App::new(Router::new(), settings.clone());
///     let chain = ChainBuilder::new(app).add_middleware(HandleError).build();
///
///     Server::bind(&settings.bind_addr).await?.serve(chain).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections forever, serving every request through `chain`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn serve(self, chain: Chain) -> Result<(), ServerError> {
        let chain = Arc::new(chain);
        info!(
            address = %self.local_addr,
            protocol = %chain.app().settings().protocol,
            "tandem listening"
        );

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let chain = Arc::clone(&chain);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, chain).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// One request is read per iteration, until the peer closes the connection
/// or a request asks for `Connection: close`.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    chain: Arc<Chain>,
) -> Result<(), ServerError> {
    let settings = chain.app().settings();
    let max_request_size = settings.max_request_size;
    let chunk_size = settings.response_chunk_size;
    let protocol = settings.protocol;

    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(AsyncMutex::new(writer));
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        if buf.is_empty() || Request::parse(&buf).is_err_and(|e| matches!(e, RequestError::Incomplete)) {
            let bytes_read = reader.read_buf(&mut buf).await?;
            if bytes_read == 0 {
                debug!(peer = %peer_addr, "connection closed by peer");
                break;
            }
        }

        if buf.len() > max_request_size {
            warn!(peer = %peer_addr, "request too large, sending 413");
            reject(&writer, HttpError::new(StatusCode::PayloadTooLarge)).await?;
            break;
        }

        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => continue,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                reject(&writer, HttpError::bad_request().with_detail(format!("Bad Request: {e}"))).await?;
                break;
            }
        };

        let content_length = match request.content_length() {
            Ok(n) => n,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "bad request, sending 400");
                reject(&writer, HttpError::bad_request().with_detail(format!("Bad Request: {e}"))).await?;
                break;
            }
        };
        let total_needed = body_offset + content_length;
        if total_needed > max_request_size {
            warn!(peer = %peer_addr, total_needed, "declared body too large, sending 413");
            reject(&writer, HttpError::new(StatusCode::PayloadTooLarge)).await?;
            break;
        }
        if buf.len() < total_needed {
            let bytes_read = reader.read_buf(&mut buf).await?;
            if bytes_read == 0 {
                debug!(peer = %peer_addr, "connection closed mid-body");
                break;
            }
            continue;
        }

        let raw = buf.split_to(total_needed).freeze();
        let body = raw.slice(body_offset..);
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let scope = Scope::new(protocol, request.method().clone(), request.path())
            .with_query(request.query_string())
            .with_headers(request.headers().clone())
            .with_client(peer_addr.to_string());

        match protocol {
            ProtocolKind::SingleShot => {
                let connection = Arc::new(WholeBody::new(body));
                chain
                    .handle(scope, Transport::single_shot(connection.clone()))
                    .await?;
                if let Some((status, headers, body)) = connection.take_response() {
                    let response = Response::new(status)
                        .headers(headers)
                        .body_bytes(body)
                        .keep_alive(keep_alive);
                    let mut writer = writer.lock().await;
                    writer.write_all(&response.into_bytes()).await?;
                    writer.flush().await?;
                }
            }
            ProtocolKind::Streaming => {
                let sender = Arc::new(ChunkedWriter {
                    writer: Arc::clone(&writer),
                    keep_alive,
                    chunked: AtomicBool::new(false),
                });
                chain
                    .handle(scope, Transport::streaming(BodyChunks::new(body, chunk_size), sender))
                    .await?;
            }
        }

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

async fn reject(writer: &AsyncMutex<OwnedWriteHalf>, err: HttpError) -> Result<(), std::io::Error> {
    let response = Response::new(err.status())
        .header("Content-Type", "application/json")
        .body(err.body().to_string())
        .keep_alive(false);
    let mut writer = writer.lock().await;
    writer.write_all(&response.into_bytes()).await?;
    writer.flush().await
}

// Single-shot adapter over a fully buffered request.
struct WholeBody {
    body: Bytes,
    response: Mutex<Option<(StatusCode, Headers, Bytes)>>,
}

impl WholeBody {
    fn new(body: Bytes) -> Self {
        Self {
            body,
            response: Mutex::new(None),
        }
    }

    fn take_response(&self) -> Option<(StatusCode, Headers, Bytes)> {
        self.response.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl Protocol for WholeBody {
    fn body(&self) -> BoxFuture<'_, Result<Bytes, TransportError>> {
        let body = self.body.clone();
        Box::pin(async move { Ok(body) })
    }

    fn respond(&self, status: StatusCode, headers: Headers, body: Bytes) -> Result<(), TransportError> {
        let mut slot = self
            .response
            .lock()
            .map_err(|_| TransportError::AlreadyResponded)?;
        if slot.is_some() {
            return Err(TransportError::AlreadyResponded);
        }
        *slot = Some((status, headers, body));
        Ok(())
    }
}

// Streaming receive side: the buffered body cut into pieces.
struct BodyChunks {
    chunks: VecDeque<Bytes>,
    done: bool,
}

impl BodyChunks {
    fn new(mut body: Bytes, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut chunks = VecDeque::new();
        while !body.is_empty() {
            chunks.push_back(body.split_to(body.len().min(chunk_size)));
        }
        Self {
            chunks,
            done: false,
        }
    }
}

impl Receive for BodyChunks {
    fn receive(&mut self) -> BoxFuture<'_, Result<Chunk, TransportError>> {
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

// Streaming send side: chunked transfer encoding on the socket.
struct ChunkedWriter {
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    keep_alive: bool,
    chunked: AtomicBool,
}

impl Sender for ChunkedWriter {
    fn send(&self, message: Message) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let mut writer = self.writer.lock().await;
            match message {
                Message::Start { status, headers } => {
                    let response = Response::new(status)
                        .headers(headers)
                        .keep_alive(self.keep_alive);
                    // Bodiless statuses go out as a complete fixed-length message.
                    if status.permits_body() {
                        self.chunked.store(true, Ordering::SeqCst);
                        writer.write_all(&response.into_chunked_head()).await?;
                    } else {
                        writer.write_all(&response.into_bytes()).await?;
                        writer.flush().await?;
                    }
                }
                Message::Body { data, more_body } => {
                    if !self.chunked.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    writer.write_all(&encode_chunk(&data)).await?;
                    if !more_body {
                        writer.write_all(LAST_CHUNK).await?;
                        writer.flush().await?;
                    }
                }
            }
            Ok(())
        })
    }
}

//! The two low-level transport shapes and the adapter that normalizes them.
//!
//! A request arrives either over a **streaming** transport, where the body is
//! pulled with repeated [`Receive::receive`] calls and the response is pushed
//! as a [`Message::Start`] followed by one or more [`Message::Body`] frames, or
//! over a **single-shot** transport, where [`Protocol::body`] yields the whole
//! body and [`Protocol::respond`] takes the whole response.
//!
//! [`Transport`] tags which shape is in play. It is resolved once at the
//! boundary and split by [`Transport::into_parts`] into a lazy
//! [`BodyReader`] and an [`Output`]; middleware and the dispatcher only ever see
//! those two.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::context::{BodyReader, BodySource};
use crate::dispatch::NormalizedResponse;
use crate::http::{Headers, StatusCode};

/// Default size of each body frame sent over a streaming transport.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Errors reported by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request body is no longer available")]
    BodyUnavailable,

    #[error("client disconnected")]
    Disconnected,

    #[error("a response was already sent for this request")]
    AlreadyResponded,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which transport shape carried a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Streaming,
    SingleShot,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Streaming => f.write_str("streaming"),
            Self::SingleShot => f.write_str("single-shot"),
        }
    }
}

/// One piece of a streamed request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Bytes,
    /// `true` when further chunks follow.
    pub more: bool,
}

/// Outgoing messages on a streaming transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Start { status: StatusCode, headers: Headers },
    Body { data: Bytes, more_body: bool },
}

/// Pull side of a streaming transport.
pub trait Receive: Send {
    fn receive(&mut self) -> BoxFuture<'_, Result<Chunk, TransportError>>;
}

/// Push side of a streaming transport.
pub trait Sender: Send + Sync {
    fn send(&self, message: Message) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// A single-shot transport: whole body in, whole response out.
pub trait Protocol: Send + Sync {
    fn body(&self) -> BoxFuture<'_, Result<Bytes, TransportError>>;

    fn respond(&self, status: StatusCode, headers: Headers, body: Bytes) -> Result<(), TransportError>;
}

/// The transport a request arrived on, tagged by shape.
pub enum Transport {
    Streaming {
        receive: Box<dyn Receive>,
        send: Arc<dyn Sender>,
    },
    SingleShot(Arc<dyn Protocol>),
}

impl Transport {
    pub fn streaming(receive: impl Receive + 'static, send: Arc<dyn Sender>) -> Self {
        Self::Streaming {
            receive: Box::new(receive),
            send,
        }
    }

    pub fn single_shot(protocol: Arc<dyn Protocol>) -> Self {
        Self::SingleShot(protocol)
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            Self::Streaming { .. } => ProtocolKind::Streaming,
            Self::SingleShot(_) => ProtocolKind::SingleShot,
        }
    }

    /// Splits the transport into the lazy body reader and the response output.
    pub fn into_parts(self, chunk_size: usize) -> (BodyReader, Output) {
        match self {
            Self::Streaming { receive, send } => (
                BodyReader::new(StreamingBody(receive)),
                Output::new(Sink::Streaming(send), chunk_size),
            ),
            Self::SingleShot(protocol) => (
                BodyReader::new(SingleShotBody(Arc::clone(&protocol))),
                Output::new(Sink::SingleShot(protocol), chunk_size),
            ),
        }
    }
}

struct StreamingBody(Box<dyn Receive>);

impl BodySource for StreamingBody {
    fn read_all(mut self: Box<Self>) -> BoxFuture<'static, Result<Bytes, TransportError>> {
        Box::pin(async move {
            let mut body = BytesMut::new();
            loop {
                let chunk = self.0.receive().await?;
                body.extend_from_slice(&chunk.data);
                if !chunk.more {
                    break;
                }
            }
            debug!(bytes = body.len(), "streamed body drained");
            Ok(body.freeze())
        })
    }
}

struct SingleShotBody(Arc<dyn Protocol>);

impl BodySource for SingleShotBody {
    fn read_all(self: Box<Self>) -> BoxFuture<'static, Result<Bytes, TransportError>> {
        Box::pin(async move { self.0.body().await })
    }
}

/// A response caught by [`Output::capture`] instead of reaching the wire.
#[derive(Clone, Default)]
pub struct Capture {
    slot: Arc<Mutex<Option<NormalizedResponse>>>,
}

impl Capture {
    /// Takes the captured response, if one was emitted.
    pub fn take(&self) -> Option<NormalizedResponse> {
        self.slot.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[derive(Clone)]
enum Sink {
    Streaming(Arc<dyn Sender>),
    SingleShot(Arc<dyn Protocol>),
    Capture { kind: ProtocolKind, capture: Capture },
}

/// Where a request's response goes.
///
/// Cloning shares the "already answered" state, so a middleware holding a
/// clone can tell whether anything beneath it finished the response.
#[derive(Clone)]
pub struct Output {
    sink: Sink,
    chunk_size: usize,
    finished: Arc<AtomicBool>,
    status: Arc<AtomicU16>,
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Output")
            .field("kind", &self.kind())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Output {
    fn new(sink: Sink, chunk_size: usize) -> Self {
        Self {
            sink,
            chunk_size: chunk_size.max(1),
            finished: Arc::new(AtomicBool::new(false)),
            status: Arc::new(AtomicU16::new(0)),
        }
    }

    /// The shape of the transport this output ultimately belongs to.
    pub fn kind(&self) -> ProtocolKind {
        match &self.sink {
            Sink::Streaming(_) => ProtocolKind::Streaming,
            Sink::SingleShot(_) => ProtocolKind::SingleShot,
            Sink::Capture { kind, .. } => *kind,
        }
    }

    /// `true` once a response has been emitted through this output.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Status of the emitted response, once there is one.
    pub fn status(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.status.load(Ordering::SeqCst))
    }

    /// A fresh output that records the response instead of writing it.
    pub fn capture(&self) -> (Output, Capture) {
        let capture = Capture::default();
        let output = Output::new(
            Sink::Capture {
                kind: self.kind(),
                capture: capture.clone(),
            },
            self.chunk_size,
        );
        (output, capture)
    }

    /// Emits `response` and finalizes the exchange.
    ///
    /// On a streaming transport the body is split into frames of at most the
    /// configured chunk size; only the last one says no more body follows.
    ///
    /// # Errors
    ///
    /// [`TransportError::AlreadyResponded`] on a second call, or whatever the
    /// transport reports.
    pub async fn send_response(&self, response: NormalizedResponse) -> Result<(), TransportError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyResponded);
        }
        self.status.store(response.status().as_u16(), Ordering::SeqCst);

        match &self.sink {
            Sink::Capture { capture, .. } => {
                if let Ok(mut slot) = capture.slot.lock() {
                    *slot = Some(response);
                }
                Ok(())
            }
            Sink::SingleShot(protocol) => {
                let (status, headers, body) = response.into_wire();
                protocol.respond(status, headers, body)
            }
            Sink::Streaming(send) => {
                let (status, headers, body) = response.into_wire();
                send.send(Message::Start { status, headers }).await?;

                let mut rest = body;
                loop {
                    let data = rest.split_to(rest.len().min(self.chunk_size));
                    let more_body = !rest.is_empty();
                    send.send(Message::Body { data, more_body }).await?;
                    if !more_body {
                        break;
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use serde_json::json;
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    struct Chunks(VecDeque<Chunk>);

    impl Receive for Chunks {
        fn receive(&mut self) -> BoxFuture<'_, Result<Chunk, TransportError>> {
            let next = self.0.pop_front().ok_or(TransportError::Disconnected);
            Box::pin(async move { next })
        }
    }

    #[derive(Default)]
    struct Recorder(AsyncMutex<Vec<Message>>);

    impl Sender for Recorder {
        fn send(&self, message: Message) -> BoxFuture<'_, Result<(), TransportError>> {
            Box::pin(async move {
                self.0.lock().await.push(message);
                Ok(())
            })
        }
    }

    fn chunk(data: &'static str, more: bool) -> Chunk {
        Chunk {
            data: Bytes::from_static(data.as_bytes()),
            more,
        }
    }

    #[tokio::test]
    async fn streamed_body_is_drained_until_no_more() {
        let receive = Chunks(VecDeque::from([chunk("ab", true), chunk("cd", false), chunk("zz", false)]));
        let (body, _) = Transport::streaming(receive, Arc::new(Recorder::default())).into_parts(4);
        assert_eq!(body.read().await.unwrap(), "abcd");
    }

    #[tokio::test]
    async fn streamed_response_is_split_into_frames() {
        let recorder = Arc::new(Recorder::default());
        let (_, output) = Transport::streaming(Chunks(VecDeque::new()), recorder.clone()).into_parts(4);
        assert_eq!(output.kind(), ProtocolKind::Streaming);

        let response = NormalizedResponse::new(StatusCode::Ok, json!("0123456789"), Headers::new());
        output.send_response(response).await.unwrap();

        let messages = recorder.0.lock().await;
        assert!(matches!(&messages[0], Message::Start { status: StatusCode::Ok, .. }));
        let frames: Vec<_> = messages[1..]
            .iter()
            .map(|m| match m {
                Message::Body { data, more_body } => (data.len(), *more_body),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        // `"0123456789"` is 12 bytes of JSON.
        assert_eq!(frames, vec![(4, true), (4, true), (4, false)]);
    }

    #[tokio::test]
    async fn empty_streamed_response_still_terminates() {
        let recorder = Arc::new(Recorder::default());
        let (_, output) = Transport::streaming(Chunks(VecDeque::new()), recorder.clone()).into_parts(4);
        let response = NormalizedResponse::new(StatusCode::NoContent, json!({"x": 1}), Headers::new());
        output.send_response(response).await.unwrap();

        let messages = recorder.0.lock().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[1],
            Message::Body {
                data: Bytes::new(),
                more_body: false
            }
        );
    }

    #[tokio::test]
    async fn second_response_is_rejected() {
        let (_, output) = Transport::streaming(Chunks(VecDeque::new()), Arc::new(Recorder::default()))
            .into_parts(DEFAULT_CHUNK_SIZE);
        let (captured, capture) = output.capture();
        let response = NormalizedResponse::new(StatusCode::Ok, json!(null), Headers::new());

        captured.send_response(response.clone()).await.unwrap();
        assert!(matches!(
            captured.send_response(response).await,
            Err(TransportError::AlreadyResponded)
        ));
        assert!(capture.take().is_some());
        assert_eq!(captured.status(), Some(StatusCode::Ok));
        assert!(!output.is_finished());
        assert_eq!(output.status(), None);
    }
}

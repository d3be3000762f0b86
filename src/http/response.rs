//! HTTP/1.1 response writer.
//!
//! Serializes a status, headers and body into HTTP/1.1 wire format, either as
//! a single fixed-length message or as a chunked head followed by
//! [`encode_chunk`] frames.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Headers, StatusCode};

/// Terminating frame of a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use tandem::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"id":1}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 8\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the whole header map.
    #[must_use]
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Serializes the response as one fixed-length HTTP/1.1 message.
    ///
    /// `Content-Length` is always (re)written from the actual body size, and
    /// `Content-Type: text/plain; charset=utf-8` is added to a non-empty body
    /// that has no content type.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = self.body.len();

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .insert("Content-Type", "text/plain; charset=utf-8");
        }
        self.headers
            .set("Content-Length", content_length.to_string());

        let mut buf = self.write_head(content_length);
        if !self.body.is_empty() {
            buf.put(self.body.as_ref());
        }
        buf
    }

    /// Serializes only the head of a response whose body follows as chunks.
    ///
    /// Any `Content-Length` header is dropped in favour of
    /// `Transfer-Encoding: chunked`; the body set on `self` is ignored.
    pub fn into_chunked_head(mut self) -> BytesMut {
        self.headers.remove("content-length");
        self.headers.set("Transfer-Encoding", "chunked");
        self.write_head(0)
    }

    fn write_head(&mut self, body_hint: usize) -> BytesMut {
        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.set("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + body_hint;
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );
        buf.put(self.headers.to_string().as_bytes());
        buf.put(&b"\r\n"[..]);
        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

/// Frames `data` as one chunk of a chunked body. Empty input yields nothing,
/// since a zero-length chunk would terminate the body early.
pub fn encode_chunk(data: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(data.len() + 12);
    if data.is_empty() {
        return buf;
    }
    buf.put(format!("{:X}\r\n", data.len()).as_bytes());
    buf.put(data);
    buf.put(&b"\r\n"[..]);
    buf
}

//! The TCP front end, driven with raw HTTP/1.1 over a loopback socket.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Value, json};
use tandem::config::Settings;
use tandem::context::RequestContext;
use tandem::dispatch::{App, Reply};
use tandem::middleware::{ChainBuilder, HandleError};
use tandem::router::Router;
use tandem::security::Cors;
use tandem::server::Server;
use tandem::transport::ProtocolKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn spawn(protocol: ProtocolKind) -> SocketAddr {
    let settings = Arc::new(Settings {
        protocol,
        response_chunk_size: 8,
        max_request_size: 1024,
        cors_whitelist: vec!["127.0.0.1".to_owned()],
        ..Settings::default()
    });

    let mut router = Router::new();
    router
        .get("/teste/<id_1:int>/teste/<id_2:int>/", |ctx: RequestContext| async move {
            Ok(Reply::json(json!({
                "arg1": ctx.param::<i64>("id_1")?,
                "arg2": ctx.param::<i64>("id_2")?,
            })))
        })
        .unwrap()
        .post("/echo/", |ctx: RequestContext| async move {
            Ok(Reply::json(ctx.body_json().await?.unwrap_or(Value::Null)))
        })
        .unwrap();

    let chain = ChainBuilder::new(App::new(router, settings.clone()))
        .add_middleware(HandleError)
        .add_middleware(Cors::from_settings(&settings))
        .build();

    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.serve(chain));
    addr
}

async fn exchange(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    String::from_utf8(raw).unwrap()
}

fn split(response: &str) -> (&str, &str) {
    response.split_once("\r\n\r\n").unwrap()
}

fn dechunk(mut body: &str) -> String {
    let mut out = String::new();
    loop {
        let (size, rest) = body.split_once("\r\n").unwrap();
        let size = usize::from_str_radix(size, 16).unwrap();
        if size == 0 {
            return out;
        }
        out.push_str(&rest[..size]);
        body = &rest[size + 2..];
    }
}

#[tokio::test]
async fn single_shot_writes_a_fixed_length_message() {
    let addr = spawn(ProtocolKind::SingleShot).await;
    let response = exchange(
        addr,
        "GET /teste/5/teste/9/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;

    let (head, body) = split(&response);
    let head = head.to_ascii_lowercase();
    assert!(head.starts_with("http/1.1 200 ok\r\n"), "{head}");
    assert!(head.contains("content-type: application/json"));
    assert!(head.contains(&format!("content-length: {}", body.len())));
    assert!(head.contains("access-control-allow-origin: *"));
    assert_eq!(serde_json::from_str::<Value>(body).unwrap(), json!({"arg1": 5, "arg2": 9}));
}

#[tokio::test]
async fn streaming_writes_chunked_frames() {
    let addr = spawn(ProtocolKind::Streaming).await;
    let payload = r#"{"message":"hello over chunks"}"#;
    let request = format!(
        "POST /echo/ HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
        payload.len()
    );
    let response = exchange(addr, &request).await;

    let (head, body) = split(&response);
    let head = head.to_ascii_lowercase();
    assert!(head.starts_with("http/1.1 200 ok\r\n"), "{head}");
    assert!(head.contains("transfer-encoding: chunked"));
    assert!(!head.contains("content-length"));
    assert!(body.starts_with("8\r\n"));
    assert_eq!(
        serde_json::from_str::<Value>(&dechunk(body)).unwrap(),
        json!({"message": "hello over chunks"})
    );
}

#[tokio::test]
async fn unknown_route_is_404_on_both_transports() {
    for protocol in [ProtocolKind::Streaming, ProtocolKind::SingleShot] {
        let addr = spawn(protocol).await;
        let response = exchange(
            addr,
            "GET /missing/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");
        assert!(response.contains("Route not Found"));
    }
}

#[tokio::test]
async fn keep_alive_serves_several_requests() {
    let addr = spawn(ProtocolKind::SingleShot).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = "GET /teste/1/teste/2/ HTTP/1.1\r\nHost: localhost\r\n\r\n\
                   GET /teste/3/teste/4/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    assert_eq!(raw.matches("HTTP/1.1 200 OK").count(), 2);
    assert!(raw.contains(r#"{"arg1":1,"arg2":2}"#));
    assert!(raw.contains(r#"{"arg1":3,"arg2":4}"#));
}

#[tokio::test]
async fn oversized_requests_get_413() {
    let addr = spawn(ProtocolKind::SingleShot).await;
    let response = exchange(
        addr,
        "POST /echo/ HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4096\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 413"), "{response}");
}

#[tokio::test]
async fn malformed_requests_get_400() {
    let addr = spawn(ProtocolKind::Streaming).await;
    let response = exchange(addr, "NOT A REQUEST\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.contains("Bad Request"));
}

//! HTTP service tests against a live listener on an ephemeral port.
//!
//! Only requests that are answered before pdfium is needed are covered here;
//! the response builders themselves are tested in `export::package`.

#![cfg(feature = "server")]

use docpipe::server::{serve, AppState};
use docpipe::{Converter, PipelineConfig};
use serde_json::Value;
use tokio::net::TcpListener;

struct Service {
    base: String,
    client: reqwest::Client,
    _results: tempfile::TempDir,
}

async fn start() -> Service {
    let results = tempfile::tempdir().unwrap();
    let converter = Converter::new(PipelineConfig::markdown().build().unwrap()).unwrap();
    let state = AppState::single(converter, results.path());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state));

    Service {
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
        _results: results,
    }
}

impl Service {
    async fn post(&self, query: &str, body: &'static [u8]) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}/convert{}", self.base, query))
            .body(body)
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        let bytes = response.bytes().await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }
}

#[tokio::test]
async fn health_reports_ok() {
    let service = start().await;
    let response = service
        .client
        .get(format!("{}/health", service.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = serde_json::from_slice(&response.bytes().await.unwrap()).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn empty_body_is_bad_request() {
    let service = start().await;
    let (status, body) = service.post("?mode=json", b"").await;
    assert_eq!(status, 400);
    assert_eq!(body["detail"], "request body is empty");
}

#[tokio::test]
async fn unknown_mode_is_bad_request() {
    let service = start().await;
    let (status, body) = service.post("?mode=tarball", b"%PDF-1.7").await;
    assert_eq!(status, 400);
    assert!(body["detail"].as_str().unwrap().contains("tarball"), "got {body}");
}

#[tokio::test]
async fn unreadable_document_is_server_error() {
    let service = start().await;
    for mode in ["archive", "json", "persist", "markdown"] {
        let (status, body) = service
            .post(&format!("?mode={mode}&file_name=notes.txt"), b"just some text")
            .await;
        assert_eq!(status, 500, "mode {mode}");
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.contains("notes.txt"), "mode {mode}: {detail}");
        assert!(detail.contains("unreadable"), "mode {mode}: {detail}");
    }
}

#[tokio::test]
async fn trailing_slash_route_is_served() {
    let service = start().await;
    let response = service
        .client
        .post(format!("{}/convert/", service.base))
        .body(Vec::<u8>::new())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

use std::io::Write;

use adaptive_fetch::{Engine, FormData, RequestBody, RequestOptions};
use http::Method;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_engine() -> Engine {
    Engine::builder()
        .with_in_memory_cookies()
        .disable_human_timing()
        .build()
        .expect("engine")
}

async fn echo_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

fn content_type(request: &wiremock::Request) -> String {
    request.headers["content-type"]
        .to_str()
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn file_fields_are_sent_as_multipart() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("report.pdf");
    std::fs::File::create(&report)
        .unwrap()
        .write_all(b"%PDF-1.4 fake")
        .unwrap();

    let server = echo_server().await;
    let engine = test_engine();
    let form = FormData::new().field("title", "Quarterly").file("document", &report);
    let response = engine
        .post(&format!("{}/upload", server.uri()), form)
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let content_type = content_type(request);
    let boundary = content_type
        .strip_prefix("multipart/form-data; boundary=")
        .expect("multipart content type");

    let body = String::from_utf8_lossy(&request.body);
    assert!(body.contains("Content-Disposition: form-data; name=\"title\"\r\n\r\nQuarterly\r\n"));
    assert!(body.contains("name=\"document\"; filename=\"report.pdf\""));
    assert!(body.contains("Content-Type: application/pdf"));
    assert!(body.contains("%PDF-1.4 fake"));
    assert!(body.ends_with(&format!("--{boundary}--\r\n")));
}

#[tokio::test]
async fn post_sets_origin_and_cors_mode() {
    let server = echo_server().await;
    let engine = test_engine();
    engine
        .post(&format!("{}/upload", server.uri()), FormData::new().field("q", "a b"))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    assert_eq!(content_type(request), "application/x-www-form-urlencoded");
    assert_eq!(&request.body[..], b"q=a+b");
    assert_eq!(request.headers["sec-fetch-mode"], "cors");
    assert_eq!(request.headers["origin"], server.uri().as_str());
}

#[tokio::test]
async fn json_flag_encodes_json() {
    let server = echo_server().await;
    let engine = test_engine();
    engine
        .execute(
            Method::PUT,
            &format!("{}/item/7", server.uri()),
            Some(RequestBody::from(FormData::new().field("name", "ferris"))),
            RequestOptions::new().as_json(),
        )
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    assert_eq!(content_type(request), "application/json");
    let sent: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(sent, json!({"name": "ferris"}));
}

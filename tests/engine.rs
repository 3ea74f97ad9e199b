use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use adaptive_fetch::{
    Engine, EngineError, EngineEvent, EventHandler, ProtectionKind, RequestOptions, cancel_pair,
};
use http::Method;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLOUDFLARE_PAGE: &str = "<html><head><title>Just a moment...</title></head>\
<body>Checking your browser before accessing the site. Cloudflare Ray ID: 1</body></html>";

fn test_engine() -> Engine {
    Engine::builder()
        .with_in_memory_cookies()
        .disable_human_timing()
        .with_delay_scale(0.0)
        .build()
        .expect("engine")
}

fn user_agent(request: &wiremock::Request) -> String {
    request
        .headers
        .get("user-agent")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn plain_get_returns_decoded_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw("<h1>hi</h1>", "text/html; charset=utf-8"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = test_engine();
    let response = engine.get(&format!("{}/hello", server.uri())).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), Some("<h1>hi</h1>"));
    assert_eq!(response.content_type(), "text/html");
    assert_eq!(response.file_extension(), "html");
    assert!(!response.is_binary());
    assert_eq!(response.suspected_protection(), ProtectionKind::None);
    assert!(response.request_headers().contains_key("user-agent"));
}

#[tokio::test]
async fn profile_and_referer_are_consistent_per_host() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let engine = test_engine();
    let first = format!("{}/first", server.uri());
    engine.get(&first).await.unwrap();
    engine.get(&format!("{}/second", server.uri())).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(user_agent(&requests[0]), user_agent(&requests[1]));
    assert!(requests[0].headers.get("referer").is_none());
    assert_eq!(requests[1].headers["referer"], first.as_str());
    assert_eq!(engine.visited_sites("127.0.0.1").len(), 2);
}

#[tokio::test]
async fn caller_headers_override_profile() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let engine = test_engine();
    let options = RequestOptions::new().with_header(
        http::header::USER_AGENT,
        http::HeaderValue::from_static("custom-agent/1.0"),
    );
    let response = engine
        .execute(Method::GET, &server.uri(), None, options)
        .await
        .unwrap();

    assert_eq!(response.request_headers()["user-agent"], "custom-agent/1.0");
    let requests = server.received_requests().await.unwrap();
    assert_eq!(user_agent(&requests[0]), "custom-agent/1.0");
}

#[tokio::test]
async fn follows_redirects_and_switches_post_to_get() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/done"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/done"))
        .respond_with(ResponseTemplate::new(200).set_body_string("thanks"))
        .expect(1)
        .mount(&server)
        .await;

    let engine = test_engine();
    let submit = format!("{}/submit", server.uri());
    let response = engine.post(&submit, "a=1").await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.url().path(), "/done");
    assert_eq!(response.text(), Some("thanks"));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[1].headers["referer"], submit.as_str());
}

#[tokio::test]
async fn endless_redirects_fail_on_the_eleventh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/loop"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
        .expect(11)
        .mount(&server)
        .await;

    let engine = test_engine();
    let err = engine
        .get(&format!("{}/loop", server.uri()))
        .await
        .unwrap_err();

    match err {
        EngineError::TooManyRedirects { count, url } => {
            assert_eq!(count, 11);
            assert_eq!(url.path(), "/loop");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn resetting_server_exhausts_retry_budget() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });

    let engine = Engine::builder()
        .with_in_memory_cookies()
        .disable_human_timing()
        .with_delay_scale(0.0)
        .with_network_retries()
        .build()
        .unwrap();

    let target = format!("http://{addr}/flaky");
    let err = engine.get(&target).await.unwrap_err();

    match err {
        EngineError::MaxRetriesExceeded { max, url } => {
            assert_eq!(max, 5);
            assert_eq!(url.as_str(), target);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(accepted.load(Ordering::SeqCst), 5);
}

/// Accepts and immediately drops every connection.
async fn resetting_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });
    (format!("http://{addr}"), accepted)
}

/// Plain HTTP proxy answering every forwarded request itself.
async fn answering_proxy(reply: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let request_lines = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&request_lines);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => head.extend_from_slice(&buf[..read]),
                }
            }
            let head = String::from_utf8_lossy(&head);
            seen.lock()
                .unwrap()
                .push(head.lines().next().unwrap_or_default().to_string());
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
                reply.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
    });
    (format!("http://{addr}"), request_lines)
}

fn proxied_engine(proxy: &str) -> Engine {
    Engine::builder()
        .with_in_memory_cookies()
        .disable_human_timing()
        .with_delay_scale(0.0)
        .with_proxies([proxy])
        .with_proxy_probability(0.0)
        .build()
        .expect("engine")
}

#[tokio::test]
async fn transport_failure_switches_to_a_proxy_once() {
    let (target, direct_hits) = resetting_server().await;
    let (proxy, request_lines) = answering_proxy("proxied").await;

    let engine = proxied_engine(&proxy);
    let response = engine.get(&format!("{target}/page")).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), Some("proxied"));
    assert_eq!(direct_hits.load(Ordering::SeqCst), 1);

    let request_lines = request_lines.lock().unwrap();
    assert_eq!(request_lines.len(), 1);
    assert!(
        request_lines[0].starts_with(&format!("GET {target}/page ")),
        "{}",
        request_lines[0]
    );
}

#[tokio::test]
async fn failing_proxy_retry_is_a_network_error() {
    let (target, direct_hits) = resetting_server().await;
    let (proxy, proxy_hits) = resetting_server().await;

    let engine = proxied_engine(&proxy);
    let err = engine.get(&format!("{target}/page")).await.unwrap_err();

    assert!(matches!(err, EngineError::Network { .. }), "{err}");
    assert_eq!(direct_hits.load(Ordering::SeqCst), 1);
    assert_eq!(proxy_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transport_failure_without_retries_is_a_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let engine = test_engine();
    let err = engine.get(&format!("http://{addr}/")).await.unwrap_err();
    assert!(matches!(err, EngineError::Network { .. }), "{err}");
}

#[tokio::test]
async fn invalid_urls_are_rejected_before_sending() {
    let engine = test_engine();
    assert!(matches!(
        engine.get("definitely not a url").await,
        Err(EngineError::InvalidUrl { .. })
    ));
    assert!(matches!(
        engine.get("file:///etc/passwd").await,
        Err(EngineError::InvalidUrl { .. })
    ));
}

#[tokio::test]
async fn cloudflare_page_triggers_exactly_one_bypass() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/guarded"))
        .respond_with(ResponseTemplate::new(503).set_body_raw(CLOUDFLARE_PAGE, "text/html"))
        .expect(3)
        .mount(&server)
        .await;

    let engine = test_engine();
    let response = engine
        .get(&format!("{}/guarded", server.uri()))
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(response.suspected_protection(), ProtectionKind::Cloudflare);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 3);
    assert!(user_agent(&requests[1]).contains("iPhone"));
    assert!(user_agent(&requests[2]).contains("Googlebot"));
}

#[tokio::test]
async fn bypass_stops_at_first_clean_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/guarded"))
        .and(wiremock::matchers::header_regex("user-agent", "iPhone"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<p>content</p>", "text/html"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/guarded"))
        .respond_with(ResponseTemplate::new(503).set_body_raw(CLOUDFLARE_PAGE, "text/html"))
        .mount(&server)
        .await;

    let engine = test_engine();
    let response = engine
        .get(&format!("{}/guarded", server.uri()))
        .await
        .unwrap();

    // The random first profile may already be a mobile Safari one.
    assert_eq!(response.status(), 200);
    assert_eq!(response.suspected_protection(), ProtectionKind::None);
    let requests = server.received_requests().await.unwrap();
    assert!(requests.len() <= 2);
}

#[tokio::test]
async fn disabled_bypass_still_reports_protection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(429).set_body_raw("<p>please complete the captcha</p>", "text/html"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let engine = Engine::builder()
        .with_in_memory_cookies()
        .disable_human_timing()
        .disable_bypass()
        .build()
        .unwrap();
    let response = engine.get(&server.uri()).await.unwrap();
    assert_eq!(response.suspected_protection(), ProtectionKind::Generic);
}

#[tokio::test]
async fn cancellation_aborts_inflight_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let engine = test_engine();
    let (handle, token) = cancel_pair();
    let uri = server.uri();
    let request = engine.execute(
        Method::GET,
        &uri,
        None,
        RequestOptions::new().with_cancel(token),
    );
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
    };

    let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(request, canceller)
    })
    .await
    .expect("cancellation did not interrupt the request");
    assert!(matches!(result, Err(EngineError::Cancelled)));
}

#[derive(Default)]
struct Recorder(Mutex<Vec<&'static str>>);

impl EventHandler for Recorder {
    fn handle(&self, event: &EngineEvent) {
        let name = match event {
            EngineEvent::PreRequest(_) => "pre",
            EngineEvent::PostResponse(_) => "post",
            EngineEvent::Redirect(_) => "redirect",
            EngineEvent::Bypass(_) => "bypass",
            EngineEvent::Error(_) => "error",
            EngineEvent::Retry(_) => "retry",
        };
        self.0.lock().unwrap().push(name);
    }
}

#[tokio::test]
async fn lifecycle_events_reach_handlers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/new"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let recorder = Arc::new(Recorder::default());
    let engine = Engine::builder()
        .with_in_memory_cookies()
        .disable_human_timing()
        .with_event_handler(recorder.clone())
        .build()
        .unwrap();
    engine.get(&format!("{}/old", server.uri())).await.unwrap();

    let events = recorder.0.lock().unwrap().clone();
    assert_eq!(events, vec!["pre", "post", "redirect", "pre", "post"]);
}

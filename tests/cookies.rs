use adaptive_fetch::Engine;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn cookie_header(request: &Request) -> String {
    request
        .headers
        .get("cookie")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn mount_session_routes(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/login"))
        .respond_with(
            ResponseTemplate::new(200)
                .append_header("set-cookie", "session=abc=123; Path=/; HttpOnly")
                .append_header("set-cookie", "theme=dark; Max-Age=3600"),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/logout"))
        .respond_with(
            ResponseTemplate::new(200).append_header("set-cookie", "session=gone; Max-Age=0; Path=/"),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/account"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

#[tokio::test]
async fn set_cookie_round_trips_and_max_age_zero_removes() {
    let server = MockServer::start().await;
    mount_session_routes(&server).await;

    let engine = Engine::builder()
        .with_in_memory_cookies()
        .disable_human_timing()
        .build()
        .unwrap();

    engine.get(&format!("{}/login", server.uri())).await.unwrap();
    let stored = engine.cookies().get("127.0.0.1", "session").unwrap();
    assert_eq!(stored.value, "abc=123");
    assert!(stored.http_only);

    engine.get(&format!("{}/account", server.uri())).await.unwrap();
    engine.get(&format!("{}/logout", server.uri())).await.unwrap();
    assert!(engine.cookies().get("127.0.0.1", "session").is_none());
    engine.get(&format!("{}/account", server.uri())).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 4);
    assert!(cookie_header(&requests[0]).is_empty());

    let with_session = cookie_header(&requests[1]);
    assert!(with_session.contains("session=abc=123"), "{with_session}");
    assert!(with_session.contains("theme=dark"), "{with_session}");

    let after_logout = cookie_header(&requests[3]);
    assert!(!after_logout.contains("session="), "{after_logout}");
    assert!(after_logout.contains("theme=dark"));
}

#[tokio::test]
async fn cookies_survive_engine_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let jar_path = dir.path().join("cookies.json");
    let server = MockServer::start().await;
    mount_session_routes(&server).await;

    {
        let engine = Engine::builder()
            .with_cookie_file(&jar_path)
            .disable_human_timing()
            .build()
            .unwrap();
        engine.get(&format!("{}/login", server.uri())).await.unwrap();
    }

    let persisted: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&jar_path).unwrap()).unwrap();
    assert_eq!(persisted["127.0.0.1"]["session"]["value"], "abc=123");
    assert_eq!(persisted["127.0.0.1"]["session"]["httpOnly"], true);
    assert!(persisted["127.0.0.1"]["session"]["expires"].is_null());
    assert!(persisted["127.0.0.1"]["theme"]["expires"].is_string());

    let engine = Engine::builder()
        .with_cookie_file(&jar_path)
        .disable_human_timing()
        .build()
        .unwrap();
    engine.get(&format!("{}/account", server.uri())).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let last = requests.last().unwrap();
    assert!(cookie_header(last).contains("session=abc=123"));
}

#[tokio::test]
async fn redirect_responses_set_cookies_for_the_next_hop() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/start"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("location", "/landing")
                .append_header("set-cookie", "visited=1; Path=/"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/landing"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let engine = Engine::builder()
        .with_in_memory_cookies()
        .disable_human_timing()
        .build()
        .unwrap();
    engine.get(&format!("{}/start", server.uri())).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(cookie_header(&requests[1]), "visited=1");
}

//! Integration tests for the HTTP fetcher
//!
//! These tests use wiremock to serve real HTTP responses and check how
//! each outcome is classified.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use sumi_conductor::config::{Config, FetchConfig, UserAgentConfig};
use sumi_conductor::crawler::Headers;
use sumi_conductor::proxy::ProxyAddress;
use sumi_conductor::{
    ErrorKind, FetchError, Fetcher, HttpFetcher, InMemoryMetrics, Orchestrator, TaskReport,
    TaskState,
};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn create_test_user_agent() -> UserAgentConfig {
    UserAgentConfig {
        crawler_name: "TestBot".to_string(),
        crawler_version: "1.0.0".to_string(),
        contact_url: "https://example.com/contact".to_string(),
        contact_email: "test@example.com".to_string(),
    }
}

fn create_test_fetcher(timeout_secs: u64) -> HttpFetcher {
    let fetch = FetchConfig {
        timeout_secs,
        ..FetchConfig::default()
    };
    HttpFetcher::new(create_test_user_agent(), &fetch)
}

async fn mount(server: &MockServer, route: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_successful_fetch() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/page",
        ResponseTemplate::new(200)
            .set_body_string("<html>hello</html>")
            .insert_header("content-type", "text/html"),
    )
    .await;

    let fetcher = create_test_fetcher(5);
    let url = format!("{}/page", server.uri());
    let response = fetcher.fetch(&url, None, &Headers::new()).await.unwrap();

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, "<html>hello</html>");
    assert_eq!(response.content_type.as_deref(), Some("text/html"));
    assert_eq!(response.final_url, url);
}

#[tokio::test]
async fn test_too_many_requests_carries_retry_after() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/limited",
        ResponseTemplate::new(429).insert_header("retry-after", "7"),
    )
    .await;

    let fetcher = create_test_fetcher(5);
    let error = fetcher
        .fetch(&format!("{}/limited", server.uri()), None, &Headers::new())
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::RateLimited);
    assert_eq!(error.retry_after(), Some(Duration::from_secs(7)));
}

#[tokio::test]
async fn test_unavailable_without_hint_is_transient() {
    let server = MockServer::start().await;
    mount(&server, "/busy", ResponseTemplate::new(503)).await;

    let fetcher = create_test_fetcher(5);
    let error = fetcher
        .fetch(&format!("{}/busy", server.uri()), None, &Headers::new())
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::TransientNetwork);
    assert_eq!(error.retry_after(), None);
}

#[tokio::test]
async fn test_client_errors_are_classified() {
    let server = MockServer::start().await;
    mount(&server, "/forbidden", ResponseTemplate::new(403)).await;
    mount(&server, "/missing", ResponseTemplate::new(404)).await;

    let fetcher = create_test_fetcher(5);
    let forbidden = fetcher
        .fetch(&format!("{}/forbidden", server.uri()), None, &Headers::new())
        .await
        .unwrap_err();
    let missing = fetcher
        .fetch(&format!("{}/missing", server.uri()), None, &Headers::new())
        .await
        .unwrap_err();

    assert_eq!(forbidden.kind(), ErrorKind::PermanentBlock);
    assert_eq!(missing.kind(), ErrorKind::Rejected);
}

#[tokio::test]
async fn test_user_agent_and_headers_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/headers"))
        .and(header(
            "user-agent",
            "TestBot/1.0.0 (+https://example.com/contact; test@example.com)",
        ))
        .and(header("accept-language", "en"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut headers = Headers::new();
    headers.insert("Accept-Language".to_string(), "en".to_string());

    let fetcher = create_test_fetcher(5);
    let response = fetcher
        .fetch(&format!("{}/headers", server.uri()), None, &headers)
        .await
        .unwrap();
    assert_eq!(response.status_code, 200);
}

#[tokio::test]
async fn test_redirect_is_followed() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/old",
        ResponseTemplate::new(301).insert_header("location", format!("{}/new", server.uri()).as_str()),
    )
    .await;
    mount(&server, "/new", ResponseTemplate::new(200).set_body_string("moved")).await;

    let fetcher = create_test_fetcher(5);
    let response = fetcher
        .fetch(&format!("{}/old", server.uri()), None, &Headers::new())
        .await
        .unwrap();

    assert_eq!(response.final_url, format!("{}/new", server.uri()));
    assert_eq!(response.body, "moved");
}

#[tokio::test]
async fn test_unreachable_proxy_is_proxy_error() {
    let server = MockServer::start().await;
    mount(&server, "/", ResponseTemplate::new(200)).await;

    // nothing listens on port 1
    let proxy = ProxyAddress::parse("127.0.0.1:1").unwrap();
    let fetcher = create_test_fetcher(5);
    let error = fetcher
        .fetch(&format!("{}/", server.uri()), Some(&proxy), &Headers::new())
        .await
        .unwrap_err();

    assert!(matches!(error, FetchError::Proxy(_)), "got {:?}", error);
}

#[tokio::test]
async fn test_unreachable_target_is_transient() {
    let fetcher = create_test_fetcher(5);
    let error = fetcher
        .fetch("http://127.0.0.1:1/", None, &Headers::new())
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::TransientNetwork);
}

#[tokio::test]
async fn test_timeout_is_transient() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/slow",
        ResponseTemplate::new(200).set_delay(Duration::from_secs(3)),
    )
    .await;

    let fetcher = create_test_fetcher(1);
    let error = fetcher
        .fetch(&format!("{}/slow", server.uri()), None, &Headers::new())
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::TransientNetwork);
}

#[tokio::test]
async fn test_orchestrated_crawl_against_mock_server() {
    let server = MockServer::start().await;
    mount(&server, "/ok", ResponseTemplate::new(200).set_body_string("fine")).await;
    mount(&server, "/gone", ResponseTemplate::new(410)).await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount(&server, "/flaky", ResponseTemplate::new(200).set_body_string("recovered")).await;

    let mut config = Config::default();
    config.user_agent = create_test_user_agent();
    config.scheduler.idle_tick_ms = 5;
    config.budget.default_rate = 100.0;
    config.budget.default_burst = 10;
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;

    let fetcher = Arc::new(HttpFetcher::new(config.user_agent.clone(), &config.fetch));
    let metrics = Arc::new(InMemoryMetrics::new());
    let orchestrator = Orchestrator::new(&config, fetcher, metrics).unwrap();

    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    orchestrator.on_result(move |report: TaskReport| sink.lock().unwrap().push(report));

    for route in ["/ok", "/gone", "/flaky"] {
        orchestrator
            .submit(&format!("{}{}", server.uri(), route), 0)
            .unwrap();
    }
    tokio::time::timeout(Duration::from_secs(10), orchestrator.run_until_idle())
        .await
        .expect("crawl did not drain in time");

    let reports = reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 3);

    let by_path = |suffix: &str| {
        reports
            .iter()
            .find(|r| r.url.ends_with(suffix))
            .cloned()
            .unwrap()
    };
    let ok = by_path("/ok");
    assert_eq!(ok.final_state, TaskState::Done);
    assert_eq!(ok.response.unwrap().body, "fine");

    let gone = by_path("/gone");
    assert_eq!(gone.final_state, TaskState::Abandoned);
    assert_eq!(gone.last_error_kind, Some(ErrorKind::Rejected));

    let flaky = by_path("/flaky");
    assert_eq!(flaky.final_state, TaskState::Done);
    assert_eq!(flaky.attempts, 2);
    assert_eq!(flaky.response.unwrap().body, "recovered");
}

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::any, Router};
use intercept_http::{
    chain, Error, InterceptClient, Matcher, MemoryCache, MockMatch, MockerTransport,
    MockerTransportConfig, PropagateHeaders, RequestContext, RuleMatcher, Transport,
    TransportWrapper, MOCK_RESPONSE_HEADER, MOCK_SWITCH_HEADER,
};
use reqwest::header::{HeaderName, HeaderValue};

#[derive(Clone)]
struct Upstream {
    hits: Arc<AtomicUsize>,
    delay: Duration,
}

async fn handler(State(state): State<Upstream>) -> impl IntoResponse {
    let n = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::time::sleep(state.delay).await;
    (
        StatusCode::OK,
        [("x-upstream-hit", n.to_string())],
        format!("real response #{n}"),
    )
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn spawn_server(delay: Duration) -> TestServer {
    let state = Upstream {
        hits: Arc::new(AtomicUsize::new(0)),
        delay,
    };
    let app = Router::new()
        .route("/*path", any(handler))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits: state.hits,
        task,
    }
}

fn mocker_transport(rules: &str) -> MockerTransport {
    MockerTransportConfig {
        matcher: Some(Arc::new(
            RuleMatcher::from_json(rules).expect("rules must parse"),
        )),
        cache: Some(Arc::new(MemoryCache::new())),
        ..Default::default()
    }
    .build()
    .expect("mocker transport must build")
}

fn get(url: &str, switched: bool) -> reqwest::Request {
    let mut builder = reqwest::Client::new().get(url);
    if switched {
        builder = builder.header(MOCK_SWITCH_HEADER, "on");
    }
    builder.build().expect("request must build")
}

fn opaque_rules(base_url: &str) -> String {
    format!(
        r#"[{{"name": "fake", "url_prefix": "{base_url}/fake", "status": 202,
             "headers": {{"x-source": "mock"}}, "body": "synthetic"}}]"#
    )
}

fn transparent_rules(base_url: &str) -> String {
    format!(r#"[{{"name": "record", "url_prefix": "{base_url}/record", "transparent": true}}]"#)
}

#[tokio::test]
async fn request_without_switch_reaches_upstream() {
    let server = spawn_server(Duration::ZERO).await;
    let transport = mocker_transport(&opaque_rules(&server.base_url));

    let response = transport
        .round_trip(get(&server.url("/fake"), false), &RequestContext::new())
        .await
        .unwrap();

    assert!(response.headers().get(MOCK_RESPONSE_HEADER).is_none());
    assert_eq!(response.text().await.unwrap(), "real response #1");
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn switched_request_without_match_reaches_upstream() {
    let server = spawn_server(Duration::ZERO).await;
    let transport = mocker_transport(&opaque_rules(&server.base_url));

    let response = transport
        .round_trip(get(&server.url("/other"), true), &RequestContext::new())
        .await
        .unwrap();

    assert!(response.headers().get(MOCK_RESPONSE_HEADER).is_none());
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn opaque_rule_serves_synthetic_response_without_network() {
    let server = spawn_server(Duration::ZERO).await;
    let transport = mocker_transport(&opaque_rules(&server.base_url));

    let response = transport
        .round_trip(get(&server.url("/fake/1"), true), &RequestContext::new())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()[MOCK_RESPONSE_HEADER], "true");
    assert_eq!(response.headers()["x-source"], "mock");
    assert_eq!(response.text().await.unwrap(), "synthetic");
    assert_eq!(server.hits(), 0);
}

#[tokio::test]
async fn concurrent_transparent_requests_record_once() {
    let server = spawn_server(Duration::from_millis(50)).await;
    let transport = Arc::new(mocker_transport(&transparent_rules(&server.base_url)));
    let ctx = RequestContext::new();

    let (a, b) = tokio::join!(
        transport.round_trip(get(&server.url("/record"), true), &ctx),
        transport.round_trip(get(&server.url("/record"), true), &ctx),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(server.hits(), 1);
    for response in [a, b] {
        assert_eq!(response.headers()[MOCK_RESPONSE_HEADER], "true");
        assert_eq!(response.headers()["x-upstream-hit"], "1");
        assert_eq!(response.text().await.unwrap(), "real response #1");
    }

    let cached = transport
        .round_trip(get(&server.url("/record"), true), &ctx)
        .await
        .unwrap();
    assert_eq!(cached.text().await.unwrap(), "real response #1");
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn transparent_mock_failure_is_cache_error_with_cause() {
    let transport = mocker_transport(&transparent_rules("http://127.0.0.1:9"));

    let err = transport
        .round_trip(get("http://127.0.0.1:9/record", true), &RequestContext::new())
        .await
        .expect_err("unreachable upstream must fail");

    match &err {
        Error::Cache { url, source } => {
            assert_eq!(url, "http://127.0.0.1:9/record");
            assert!(matches!(**source, Error::Generate { .. }));
        }
        other => panic!("expected cache error, got {other:?}"),
    }
}

struct Broken;

impl Matcher for Broken {
    fn match_request(
        &self,
        _request: &reqwest::Request,
    ) -> Result<Option<MockMatch>, Box<dyn std::error::Error + Send + Sync>> {
        Err("rule store unavailable".into())
    }
}

#[tokio::test]
async fn matcher_failure_is_reported_with_url() {
    let transport = MockerTransportConfig {
        matcher: Some(Arc::new(Broken)),
        cache: Some(Arc::new(MemoryCache::new())),
        ..Default::default()
    }
    .build()
    .unwrap();

    let err = transport
        .round_trip(get("http://svc.local/a", true), &RequestContext::new())
        .await
        .expect_err("matcher failure must surface");

    match err {
        Error::Match { url, source } => {
            assert_eq!(url, "http://svc.local/a");
            assert_eq!(source.to_string(), "rule store unavailable");
        }
        other => panic!("expected match error, got {other:?}"),
    }
}

#[tokio::test]
async fn mocker_inside_chain_sees_propagated_switch() {
    let server = spawn_server(Duration::ZERO).await;
    let wrappers: Vec<Box<dyn TransportWrapper>> = vec![
        Box::new(PropagateHeaders::new()),
        Box::new(mocker_transport(&opaque_rules(&server.base_url))),
    ];
    let client = InterceptClient::from_wrappers(wrappers);
    let ctx = RequestContext::new().with_propagated_header(
        HeaderName::from_static(MOCK_SWITCH_HEADER),
        HeaderValue::from_static("on"),
    );

    let response = client
        .execute(get(&server.url("/fake"), false), &ctx)
        .await
        .unwrap();

    assert_eq!(response.headers()[MOCK_RESPONSE_HEADER], "true");
    assert_eq!(server.hits(), 0);

    let passthrough = chain(vec![Box::new(PropagateHeaders::new())])
        .round_trip(get(&server.url("/fake"), false), &RequestContext::new())
        .await
        .unwrap();
    assert!(passthrough.headers().get(MOCK_RESPONSE_HEADER).is_none());
    assert_eq!(server.hits(), 1);
}

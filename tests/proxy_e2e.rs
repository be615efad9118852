//! End-to-end tests: a real proxy in front of real loopback backends.
//!
//! Each test stands up hyper servers on ephemeral ports, wires a router
//! around them, and drives traffic through the proxy's listening
//! surface. The Prometheus recorder is global to the test process, so
//! metric assertions check for presence rather than exact counts.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;

use httplb::circuit::CircuitRegistry;
use httplb::lb::{
    Backend, HealthState, LeastConnections, PassiveTracker, Pool, RoundRobin, Strategy,
};
use httplb::proxy::{CancelToken, ProxyServer, Router};
use httplb::retry::{RetryBudget, RetryPolicy};

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

fn recorder() -> PrometheusHandle {
    RECORDER
        .get_or_init(|| httplb::metrics::install_recorder().unwrap())
        .clone()
}

/// What an upstream saw for one request.
#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    request_id: Option<String>,
    body: Bytes,
}

/// A loopback upstream whose status code is a function of the hit index.
struct Upstream {
    url: String,
    hits: Arc<AtomicU64>,
    seen: Arc<Mutex<Vec<Recorded>>>,
}

impl Upstream {
    fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    fn seen(&self) -> Vec<Recorded> {
        self.seen.lock().unwrap().clone()
    }

    fn backend(&self) -> Arc<Backend> {
        Arc::new(Backend::new(self.url.parse().unwrap()))
    }

    fn key(&self) -> String {
        self.url.trim_start_matches("http://").to_string()
    }
}

async fn spawn_upstream<F>(status_for_hit: F) -> Upstream
where
    F: Fn(u64) -> u16 + Send + Sync + Clone + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU64::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let task_hits = Arc::clone(&hits);
    let task_seen = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let hits = Arc::clone(&task_hits);
            let seen = Arc::clone(&task_seen);
            let status_for_hit = status_for_hit.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let hits = Arc::clone(&hits);
                    let seen = Arc::clone(&seen);
                    let status_for_hit = status_for_hit.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.unwrap().to_bytes();
                        let request_id = parts
                            .headers
                            .get("x-request-id")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        seen.lock().unwrap().push(Recorded {
                            method: parts.method.to_string(),
                            path: parts.uri.path().to_string(),
                            request_id,
                            body,
                        });
                        let hit = hits.fetch_add(1, Ordering::SeqCst);
                        let status =
                            StatusCode::from_u16(status_for_hit(hit)).unwrap_or(StatusCode::OK);
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from_static(b"upstream")))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Upstream {
        url: format!("http://{addr}"),
        hits,
        seen,
    }
}

/// An address with nothing listening behind it.
async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn build_pool(upstreams: &[&Upstream]) -> Arc<Pool> {
    let pool = Arc::new(Pool::new());
    for upstream in upstreams {
        pool.add(upstream.backend());
    }
    pool
}

fn build_router(
    pool: Arc<Pool>,
    strategy: Box<dyn Strategy>,
    retry: Option<RetryPolicy>,
    passive_threshold: u32,
    breakers: Arc<CircuitRegistry>,
) -> Arc<Router> {
    Arc::new(Router::new(
        pool,
        strategy,
        PassiveTracker::new(passive_threshold),
        retry,
        breakers,
        Duration::from_secs(5),
    ))
}

async fn start_proxy(router: Arc<Router>) -> (SocketAddr, CancelToken) {
    let drain = CancelToken::new();
    let server = ProxyServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        router,
        recorder(),
        drain.clone(),
    )
    .await
    .unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run());
    (addr, drain)
}

fn client() -> HyperClient<HttpConnector, Full<Bytes>> {
    HyperClient::builder(TokioExecutor::new()).build(HttpConnector::new())
}

async fn send(
    client: &HyperClient<HttpConnector, Full<Bytes>>,
    method: Method,
    url: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> (StatusCode, HeaderMap, Bytes) {
    let mut builder = Request::builder().method(method).uri(url);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Full::new(Bytes::from(body.to_string()))).unwrap();

    let response = client.request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (parts.status, parts.headers, body)
}

/// Funds a retry budget by simulating observed traffic and letting a
/// refill window elapse.
async fn funded_policy(max_attempts: u32) -> RetryPolicy {
    let budget = Arc::new(RetryBudget::new(100));
    for _ in 0..1000 {
        budget.track_request();
    }
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(budget.available() > 0, "budget should hold tokens after refill");
    RetryPolicy::new(max_attempts, budget)
}

#[tokio::test]
async fn single_backend_round_trip_with_request_id() {
    let upstream = spawn_upstream(|_| 200).await;
    let pool = build_pool(&[&upstream]);
    let router = build_router(
        pool,
        Box::new(RoundRobin::new()),
        None,
        5,
        Arc::new(CircuitRegistry::new()),
    );
    let (addr, _drain) = start_proxy(router).await;

    let client = client();
    let (status, headers, body) =
        send(&client, Method::GET, &format!("http://{addr}/"), &[], "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"upstream");
    assert_eq!(upstream.hits(), 1);

    // A correlation id was generated and reached both sides.
    let seen = upstream.seen();
    let upstream_id = seen[0].request_id.clone().expect("upstream saw no request id");
    assert!(!upstream_id.is_empty());
    let response_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .expect("response has no request id");
    assert_eq!(response_id, upstream_id);
}

#[tokio::test]
async fn client_supplied_request_id_is_propagated() {
    let upstream = spawn_upstream(|_| 200).await;
    let pool = build_pool(&[&upstream]);
    let router = build_router(
        pool,
        Box::new(RoundRobin::new()),
        None,
        5,
        Arc::new(CircuitRegistry::new()),
    );
    let (addr, _drain) = start_proxy(router).await;

    let client = client();
    let (status, headers, _) = send(
        &client,
        Method::GET,
        &format!("http://{addr}/widget"),
        &[("x-request-id", "req-fixed-42")],
        "",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let seen = upstream.seen();
    assert_eq!(seen[0].request_id.as_deref(), Some("req-fixed-42"));
    assert_eq!(seen[0].path, "/widget");
    assert_eq!(
        headers.get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("req-fixed-42")
    );
}

#[tokio::test]
async fn round_robin_fans_out_evenly() {
    let a = spawn_upstream(|_| 200).await;
    let b = spawn_upstream(|_| 200).await;
    let c = spawn_upstream(|_| 200).await;
    let pool = build_pool(&[&a, &b, &c]);
    let router = build_router(
        pool,
        Box::new(RoundRobin::new()),
        None,
        5,
        Arc::new(CircuitRegistry::new()),
    );
    let (addr, _drain) = start_proxy(router).await;

    let client = client();
    for _ in 0..9 {
        let (status, _, _) =
            send(&client, Method::GET, &format!("http://{addr}/"), &[], "").await;
        assert_eq!(status, StatusCode::OK);
    }

    assert_eq!(a.hits(), 3);
    assert_eq!(b.hits(), 3);
    assert_eq!(c.hits(), 3);
}

#[tokio::test]
async fn server_error_fails_over_to_next_backend() {
    let failing = spawn_upstream(|_| 503).await;
    let healthy = spawn_upstream(|_| 200).await;
    let pool = build_pool(&[&failing, &healthy]);
    let router = build_router(
        pool,
        Box::new(RoundRobin::new()),
        Some(funded_policy(3).await),
        5,
        Arc::new(CircuitRegistry::new()),
    );
    let (addr, _drain) = start_proxy(router).await;

    let client = client();
    let (status, _, body) =
        send(&client, Method::GET, &format!("http://{addr}/"), &[], "").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), b"upstream");
    assert_eq!(failing.hits(), 1);
    assert_eq!(healthy.hits(), 1);

    let exposition = recorder().render();
    assert!(
        exposition.contains("retries_total{reason=\"server_error\"}"),
        "missing server_error retry counter in:\n{exposition}"
    );
}

#[tokio::test]
async fn put_body_survives_the_retry() {
    let failing = spawn_upstream(|_| 503).await;
    let healthy = spawn_upstream(|_| 200).await;
    let pool = build_pool(&[&failing, &healthy]);
    let router = build_router(
        pool,
        Box::new(RoundRobin::new()),
        Some(funded_policy(3).await),
        5,
        Arc::new(CircuitRegistry::new()),
    );
    let (addr, _drain) = start_proxy(router).await;

    let client = client();
    let (status, _, _) = send(
        &client,
        Method::PUT,
        &format!("http://{addr}/objects/1"),
        &[],
        "preserved",
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let seen = healthy.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "PUT");
    assert_eq!(seen[0].body.as_ref(), b"preserved");

    // The first attempt carried the same body.
    let first = failing.seen();
    assert_eq!(first[0].body.as_ref(), b"preserved");
}

#[tokio::test]
async fn post_is_never_retried() {
    let failing = spawn_upstream(|_| 503).await;
    let healthy = spawn_upstream(|_| 200).await;
    let pool = build_pool(&[&failing, &healthy]);
    let router = build_router(
        pool,
        Box::new(RoundRobin::new()),
        Some(funded_policy(3).await),
        5,
        Arc::new(CircuitRegistry::new()),
    );
    let (addr, _drain) = start_proxy(router).await;

    let client = client();
    let (status, _, _) = send(
        &client,
        Method::POST,
        &format!("http://{addr}/submit"),
        &[],
        "payload",
    )
    .await;

    // The 503 from attempt 1 is the answer; nothing reached the healthy
    // backend.
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(failing.hits(), 1);
    assert_eq!(healthy.hits(), 0);
}

#[tokio::test]
async fn circuit_opens_and_requests_bypass_the_dead_backend() {
    let dead = dead_address().await;
    let healthy = spawn_upstream(|_| 200).await;

    let pool = Arc::new(Pool::new());
    let dead_backend = Arc::new(Backend::new(format!("http://{dead}").parse().unwrap()));
    let dead_key = dead_backend.key().to_string();
    pool.add(dead_backend);
    pool.add(healthy.backend());

    let breakers = Arc::new(CircuitRegistry::new());
    // Passive threshold far out of reach: the circuit is the isolator.
    let router = build_router(
        Arc::clone(&pool),
        Box::new(RoundRobin::new()),
        Some(funded_policy(3).await),
        1000,
        Arc::clone(&breakers),
    );
    let (addr, _drain) = start_proxy(router).await;

    let client = client();
    for _ in 0..12 {
        let (status, _, _) =
            send(&client, Method::GET, &format!("http://{addr}/"), &[], "").await;
        assert_eq!(status, StatusCode::OK);
    }

    assert_eq!(
        breakers.get_or_create(&dead_key).state(),
        httplb::circuit::CircuitState::Open
    );
    assert_eq!(healthy.hits(), 12);

    let exposition = recorder().render();
    assert!(
        exposition.contains("retries_total{reason=\"circuit_open\"}"),
        "missing circuit_open retry counter in:\n{exposition}"
    );
}

#[tokio::test]
async fn no_healthy_backends_yields_503() {
    let upstream = spawn_upstream(|_| 200).await;
    let pool = build_pool(&[&upstream]);
    for backend in pool.snapshot_all() {
        backend.set_state(HealthState::Unhealthy);
    }
    let router = build_router(
        pool,
        Box::new(RoundRobin::new()),
        None,
        5,
        Arc::new(CircuitRegistry::new()),
    );
    let (addr, _drain) = start_proxy(router).await;

    let client = client();
    let (status, _, _) =
        send(&client, Method::GET, &format!("http://{addr}/"), &[], "").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn cancelled_request_yields_499() {
    let upstream = spawn_upstream(|_| 200).await;
    let pool = build_pool(&[&upstream]);
    let router = build_router(
        pool,
        Box::new(RoundRobin::new()),
        None,
        5,
        Arc::new(CircuitRegistry::new()),
    );

    let cancel = CancelToken::new();
    cancel.cancel();

    let request = Request::builder()
        .method(Method::GET)
        .uri("/")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = router.dispatch(request, cancel).await;

    assert_eq!(response.status().as_u16(), 499);
    assert_eq!(upstream.hits(), 0);
}

#[tokio::test]
async fn lb_health_route_reports_pool_state() {
    let upstream = spawn_upstream(|_| 200).await;
    let pool = build_pool(&[&upstream]);
    let router = build_router(
        Arc::clone(&pool),
        Box::new(RoundRobin::new()),
        None,
        5,
        Arc::new(CircuitRegistry::new()),
    );
    let (addr, _drain) = start_proxy(router).await;

    let client = client();
    let (status, _, body) = send(
        &client,
        Method::GET,
        &format!("http://{addr}/lb-health"),
        &[],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8_lossy(&body).to_string();
    assert!(text.contains("\"status\":\"ok\""));
    assert!(text.contains("\"healthy_backends\":1"));

    for backend in pool.snapshot_all() {
        backend.set_state(HealthState::Down);
    }
    let (status, _, _) = send(
        &client,
        Method::GET,
        &format!("http://{addr}/lb-health"),
        &[],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn metrics_route_serves_text_exposition() {
    let upstream = spawn_upstream(|_| 200).await;
    let pool = build_pool(&[&upstream]);
    let router = build_router(
        pool,
        Box::new(RoundRobin::new()),
        None,
        5,
        Arc::new(CircuitRegistry::new()),
    );
    let (addr, _drain) = start_proxy(router).await;

    let client = client();
    // Generate at least one data point first.
    send(&client, Method::GET, &format!("http://{addr}/"), &[], "").await;

    let (status, headers, body) = send(
        &client,
        Method::GET,
        &format!("http://{addr}/metrics"),
        &[],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/plain"));
    assert!(String::from_utf8_lossy(&body).contains("requests_total"));
}

#[tokio::test]
async fn least_connections_prefers_the_idle_backend() {
    let busy = spawn_upstream(|_| 200).await;
    let idle = spawn_upstream(|_| 200).await;

    let pool = Arc::new(Pool::new());
    let busy_backend = busy.backend();
    pool.add(Arc::clone(&busy_backend));
    pool.add(idle.backend());

    // Pin synthetic load on the first backend.
    let _load: Vec<_> = (0..4).map(|_| busy_backend.begin_request()).collect();

    let router = build_router(
        pool,
        Box::new(LeastConnections::new()),
        None,
        5,
        Arc::new(CircuitRegistry::new()),
    );
    let (addr, _drain) = start_proxy(router).await;

    let client = client();
    for _ in 0..5 {
        let (status, _, _) =
            send(&client, Method::GET, &format!("http://{addr}/"), &[], "").await;
        assert_eq!(status, StatusCode::OK);
    }

    assert_eq!(busy.hits(), 0);
    assert_eq!(idle.hits(), 5);
}

#[tokio::test]
async fn hot_replace_keeps_traffic_flowing_and_carries_state() {
    let a = spawn_upstream(|_| 200).await;
    let b = spawn_upstream(|_| 200).await;
    let c = spawn_upstream(|_| 200).await;

    let pool = Arc::new(Pool::new());
    pool.add(a.backend());
    pool.add(b.backend());

    let router = build_router(
        Arc::clone(&pool),
        Box::new(RoundRobin::new()),
        None,
        5,
        Arc::new(CircuitRegistry::new()),
    );
    let (addr, _drain) = start_proxy(router).await;

    let traffic = tokio::spawn({
        let client = client();
        let url = format!("http://{addr}/");
        async move {
            let mut statuses = Vec::new();
            for _ in 0..60 {
                let (status, _, _) = send(&client, Method::GET, &url, &[], "").await;
                statuses.push(status);
            }
            statuses
        }
    });

    // Reload churn while the traffic runs: membership flips between
    // {a, b} and {a, c}, always fully healthy.
    for i in 0..30 {
        let replacement = if i % 2 == 0 {
            vec![a.backend(), c.backend()]
        } else {
            vec![a.backend(), b.backend()]
        };
        pool.replace(replacement);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let statuses = traffic.await.unwrap();
    assert!(statuses.iter().all(|s| *s == StatusCode::OK), "{statuses:?}");

    // Health state of a surviving key carries into the next generation.
    let current_a = pool
        .snapshot_all()
        .into_iter()
        .find(|backend| backend.key() == a.key())
        .unwrap();
    current_a.set_state(HealthState::Unhealthy);
    current_a.record_failure();

    pool.replace(vec![a.backend(), b.backend()]);
    let next_a = pool
        .snapshot_all()
        .into_iter()
        .find(|backend| backend.key() == a.key())
        .unwrap();
    assert_eq!(next_a.state(), HealthState::Unhealthy);
    assert_eq!(next_a.health_record().consecutive_failures, 1);

    // No request leaked an active-count increment.
    for backend in pool.snapshot_all() {
        assert_eq!(backend.active_count(), 0);
    }
}

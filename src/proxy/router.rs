use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderName, HeaderValue};
use hyper::http::request::Parts;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::circuit::CircuitRegistry;
use crate::lb::backend::Backend;
use crate::lb::passive::PassiveTracker;
use crate::lb::pool::Pool;
use crate::lb::strategy::Strategy;
use crate::metrics;
use crate::retry::RetryPolicy;

/// HTTP body type for client responses.
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body sent upstream: a replayed buffer or the client's live stream.
type UpstreamBody = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;

static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Connection-scoped headers that must not cross a buffering proxy.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Non-standard status used when the client went away before a response
/// was committed.
const STATUS_CLIENT_CLOSED: u16 = 499;

/// Cooperative cancellation flag for a request.
///
/// The server hands every request a clone of its drain token; when
/// shutdown begins the token trips and in-flight requests stop at their
/// next attempt boundary instead of retrying into a dying process.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Why a forwarding attempt failed.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("connect error: {0}")]
    Connect(String),

    #[error("upstream request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream answered with this status; 5xx statuses are treated as
    /// backend failures.
    #[error("upstream status {0}")]
    Status(u16),
}

/// A fully buffered upstream response.
///
/// Buffering before anything reaches the client is what makes retry on
/// 5xx sound: a discarded attempt leaves no partial bytes behind, and
/// exactly one attempt ever produces client-visible output.
struct UpstreamReply {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Request body staged for forwarding.
enum RequestPayload {
    /// Replayable copy, held when retry is enabled.
    Buffered(Bytes),
    /// One-shot stream, passed through when it is not.
    Streaming(Option<UpstreamBody>),
}

impl RequestPayload {
    fn body_for_attempt(&mut self) -> Option<UpstreamBody> {
        match self {
            RequestPayload::Buffered(bytes) => Some(
                Full::new(bytes.clone())
                    .map_err(|never| match never {})
                    .boxed_unsync(),
            ),
            RequestPayload::Streaming(body) => body.take(),
        }
    }
}

/// Routes one client request to a backend, with circuit gating, outcome
/// feedback, and budgeted retries.
pub struct Router {
    pool: Arc<Pool>,
    strategy: Box<dyn Strategy>,
    passive: PassiveTracker,
    retry: Option<RetryPolicy>,
    breakers: Arc<CircuitRegistry>,
    client: HyperClient<HttpConnector, UpstreamBody>,
    request_timeout: Duration,
}

impl Router {
    pub fn new(
        pool: Arc<Pool>,
        strategy: Box<dyn Strategy>,
        passive: PassiveTracker,
        retry: Option<RetryPolicy>,
        breakers: Arc<CircuitRegistry>,
        request_timeout: Duration,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(request_timeout));
        let client = HyperClient::builder(TokioExecutor::new()).build(connector);

        Self {
            pool,
            strategy,
            passive,
            retry,
            breakers,
            client,
            request_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn breakers(&self) -> &Arc<CircuitRegistry> {
        &self.breakers
    }

    pub fn retry_budget(&self) -> Option<&Arc<crate::retry::RetryBudget>> {
        self.retry.as_ref().map(|r| r.budget())
    }

    /// Handles one client request end to end and always produces a
    /// response; every failure mode maps to a status code.
    pub async fn dispatch<B>(&self, req: Request<B>, cancel: CancelToken) -> Response<BoxBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();

        let request_id = parts
            .headers
            .get(&X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // The body is held in memory only when a retry might need to
        // replay it. With retry disabled the client's stream goes
        // upstream as-is, and a mid-stream failure surfaces as an
        // upstream transport error.
        let mut payload = if self.retry.is_some() {
            match body.collect().await {
                Ok(collected) => RequestPayload::Buffered(collected.to_bytes()),
                Err(e) => {
                    let e: BoxError = e.into();
                    warn!(error = %e, "request_body_buffering_failed");
                    return attach_request_id(
                        error_response(StatusCode::BAD_REQUEST, "failed to read request body"),
                        &request_id,
                    );
                }
            }
        } else {
            RequestPayload::Streaming(Some(body.map_err(Into::into).boxed_unsync()))
        };

        let max_attempts = self.retry.as_ref().map_or(1, |r| r.max_attempts()).max(1);
        if let Some(retry) = &self.retry {
            retry.budget().track_request();
        }

        let response = self
            .attempt_loop(&parts, &mut payload, &request_id, max_attempts, &cancel)
            .await;
        attach_request_id(response, &request_id)
    }

    async fn attempt_loop(
        &self,
        parts: &Parts,
        payload: &mut RequestPayload,
        request_id: &str,
        max_attempts: u32,
        cancel: &CancelToken,
    ) -> Response<BoxBody> {
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                debug!(request_id, "client_cancelled");
                return error_response(
                    StatusCode::from_u16(STATUS_CLIENT_CLOSED)
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                    "client closed request",
                );
            }

            let healthy = self.pool.snapshot_healthy();
            let Some(backend) = self.strategy.select(&healthy) else {
                warn!(request_id, "no_healthy_backends");
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "no healthy backends");
            };

            let breaker = self.breakers.get_or_create(backend.key());
            if !breaker.admit() {
                debug!(
                    request_id,
                    backend = backend.key(),
                    attempt,
                    "circuit_open_reselecting"
                );
                if attempt < max_attempts {
                    metrics::record_retry("circuit_open");
                    continue;
                }
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "no admissible backend");
            }

            debug!(
                request_id,
                backend = backend.key(),
                attempt,
                state = %backend.state(),
                circuit = %breaker.state(),
                "forwarding_request"
            );

            // A streaming body exists once; only the buffered form can
            // feed another attempt.
            let Some(upstream_body) = payload.body_for_attempt() else {
                error!(request_id, "request_body_not_replayable");
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal proxy error");
            };

            let started = Instant::now();
            let outcome = {
                let _active = backend.begin_request();
                self.forward(&backend, parts, upstream_body, request_id).await
            };
            let elapsed = started.elapsed();

            let failure = match outcome {
                Ok(reply) if reply.status.as_u16() >= 500 => {
                    metrics::record_request(
                        backend.key(),
                        parts.method.as_str(),
                        reply.status.as_u16(),
                        elapsed.as_secs_f64(),
                    );
                    self.passive.record_failure(&backend);
                    breaker.record_failure();

                    let status = reply.status.as_u16();
                    if self.permits_retry(parts, ForwardError::Status(status), attempt, cancel) {
                        metrics::record_retry("server_error");
                        continue;
                    }
                    // Not retryable: the buffered 5xx is the answer.
                    return client_response(reply);
                }
                Ok(reply) => {
                    metrics::record_request(
                        backend.key(),
                        parts.method.as_str(),
                        reply.status.as_u16(),
                        elapsed.as_secs_f64(),
                    );
                    self.passive.record_success(&backend);
                    breaker.record_success();
                    return client_response(reply);
                }
                Err(failure) => failure,
            };

            metrics::record_request(
                backend.key(),
                parts.method.as_str(),
                StatusCode::BAD_GATEWAY.as_u16(),
                elapsed.as_secs_f64(),
            );
            self.passive.record_failure(&backend);
            breaker.record_failure();

            warn!(
                request_id,
                backend = backend.key(),
                attempt,
                error = %failure,
                "upstream_attempt_failed"
            );

            if self.permits_retry(parts, failure, attempt, cancel) {
                metrics::record_retry("server_error");
                continue;
            }
            return error_response(StatusCode::BAD_GATEWAY, "upstream request failed");
        }

        error_response(StatusCode::SERVICE_UNAVAILABLE, "no admissible backend")
    }

    fn permits_retry(
        &self,
        parts: &Parts,
        failure: ForwardError,
        attempt: u32,
        cancel: &CancelToken,
    ) -> bool {
        match &self.retry {
            Some(policy) => {
                policy.should_retry(&parts.method, &failure, attempt, cancel.is_cancelled())
            }
            None => false,
        }
    }

    /// One forwarding attempt: sends the staged body upstream and
    /// collects the full response before returning.
    async fn forward(
        &self,
        backend: &Backend,
        parts: &Parts,
        body: UpstreamBody,
        request_id: &str,
    ) -> Result<UpstreamReply, ForwardError> {
        let request = self.build_upstream_request(backend, parts, body, request_id)?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(classify_client_error)?;

            let (parts, body) = response.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|e| ForwardError::Transport(e.to_string()))?
                .to_bytes();

            Ok(UpstreamReply {
                status: parts.status,
                headers: parts.headers,
                body,
            })
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout),
        }
    }

    fn build_upstream_request(
        &self,
        backend: &Backend,
        parts: &Parts,
        body: UpstreamBody,
        request_id: &str,
    ) -> Result<Request<UpstreamBody>, ForwardError> {
        let base = backend.url().as_str().trim_end_matches('/');
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("{}{}", base, path_and_query);

        let mut builder = Request::builder().method(parts.method.clone()).uri(uri);

        // End-to-end headers pass through untouched. Host is rewritten
        // to the backend authority and the correlation id is ours.
        for (name, value) in &parts.headers {
            if name == &hyper::header::HOST || name == &X_REQUEST_ID || is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder = builder.header(&X_REQUEST_ID, request_id);

        builder
            .body(body)
            .map_err(|e| ForwardError::Transport(format!("invalid upstream request: {e}")))
    }
}

fn classify_client_error(error: hyper_util::client::legacy::Error) -> ForwardError {
    if error.is_connect() {
        ForwardError::Connect(error.to_string())
    } else {
        ForwardError::Transport(error.to_string())
    }
}

/// Converts a buffered upstream reply into the client response.
fn client_response(reply: UpstreamReply) -> Response<BoxBody> {
    let mut builder = Response::builder().status(reply.status);
    for (name, value) in &reply.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(bytes_body(reply.body))
        .unwrap_or_else(|e| {
            error!(error = %e, "response_build_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal proxy error")
        })
}

fn attach_request_id(mut response: Response<BoxBody>, request_id: &str) -> Response<BoxBody> {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(&X_REQUEST_ID, value);
    }
    response
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(string_body(message.to_string()))
        .unwrap_or_else(|_| Response::new(string_body(String::new())))
}

pub(crate) fn string_body(s: String) -> BoxBody {
    Full::new(Bytes::from(s))
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn bytes_body(b: Bytes) -> BoxBody {
    Full::new(b).map_err(|never| match never {}).boxed()
}

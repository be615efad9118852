use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::lb::pool::Pool;

use super::router::{error_response, string_body, BoxBody, CancelToken, Router};

/// The proxy's listening surface: one HTTP/1.1 port serving the metrics
/// exposition, the balancer's own health endpoint, and proxied traffic
/// for everything else.
pub struct ProxyServer {
    router: Arc<Router>,
    metrics: PrometheusHandle,
    drain: CancelToken,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ProxyServer {
    /// Binds the listening socket. Serving starts with `run`.
    pub async fn bind(
        addr: SocketAddr,
        router: Arc<Router>,
        metrics: PrometheusHandle,
        drain: CancelToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind to {addr}"))?;
        let local_addr = listener.local_addr().context("no local address")?;

        Ok(Self {
            router,
            metrics,
            drain,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop. Each connection is served on its own task; requests
    /// inherit the drain token so shutdown stops their retry loops.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr, "proxy_listening");

        let server = Arc::new(self);
        loop {
            let (stream, remote_addr) = match server.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "accept_failed");
                    continue;
                }
            };

            let server = Arc::clone(&server);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let server = Arc::clone(&server);
                    async move { server.handle(req).await }
                });

                if let Err(e) = http1::Builder::new()
                    .keep_alive(true)
                    .serve_connection(io, service)
                    .await
                {
                    // Clients dropping mid-connection are routine.
                    let message = e.to_string();
                    if !message.contains("connection reset") && !message.contains("broken pipe") {
                        error!(remote = %remote_addr, error = %message, "connection_error");
                    }
                }
            });
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Result<Response<BoxBody>> {
        if req.method() == Method::GET && req.uri().path() == "/metrics" {
            return Ok(self.render_metrics());
        }
        if req.method() == Method::GET && req.uri().path() == "/lb-health" {
            return Ok(self.render_health(self.router.pool()));
        }
        Ok(self.router.dispatch(req, self.drain.clone()).await)
    }

    fn render_metrics(&self) -> Response<BoxBody> {
        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(string_body(self.metrics.render()))
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, ""))
    }

    fn render_health(&self, pool: &Pool) -> Response<BoxBody> {
        let healthy = pool.snapshot_healthy().len();
        if healthy == 0 {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "no healthy backends");
        }
        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(string_body(format!(
                "{{\"status\":\"ok\",\"healthy_backends\":{healthy}}}"
            )))
            .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, ""))
    }
}

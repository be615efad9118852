//! Throwaway upstream for exercising the proxy locally: run a few of
//! these on different ports and point the backend list at them.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "testserver")]
#[command(version, about = "Test backend for exercising the proxy", long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value = "8081")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let addr = SocketAddr::from(([127, 0, 0, 1], cli.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(port = cli.port, "test_server_listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let port = cli.port;
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, port));
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }
}

async fn handle(req: Request<Incoming>, port: u16) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!(port, %method, path, "request");

    let (status, body) = match path.as_str() {
        "/health" => (
            StatusCode::OK,
            format!("{{\"status\":\"healthy\",\"port\":{port}}}"),
        ),
        "/" => (
            StatusCode::OK,
            format!("{{\"backend\":\"testserver\",\"port\":{port},\"method\":\"{method}\"}}"),
        ),
        "/delay" => {
            tokio::time::sleep(Duration::from_millis(100)).await;
            (
                StatusCode::OK,
                "{\"status\":\"ok\",\"delay_ms\":100}".to_string(),
            )
        }
        "/error" => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "{\"error\":\"simulated error\"}".to_string(),
        ),
        other => (
            StatusCode::OK,
            format!("{{\"path\":\"{other}\",\"port\":{port}}}"),
        ),
    };

    Ok(Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

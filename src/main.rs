use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use httplb::circuit::CircuitRegistry;
use httplb::config::Config;
use httplb::lb::{
    ActiveProber, Backend, LeastConnections, PassiveTracker, Pool, RoundRobin, Strategy,
    WeightedRoundRobin,
};
use httplb::metrics;
use httplb::proxy::{CancelToken, ProxyServer, Router};
use httplb::retry::{RetryBudget, RetryPolicy};

/// Failures observed by the passive tracker before a backend is demoted.
const PASSIVE_FAILURE_THRESHOLD: u32 = 5;

/// How long in-flight requests get to finish after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "httplb")]
#[command(version, about = "HTTP/1.1 reverse proxy with health-aware load balancing", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "configs/config.yaml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    info!("starting_load_balancer");

    let config = Config::load(&cli.config)?;
    let metrics_handle = metrics::install_recorder()?;

    let pool = Arc::new(Pool::new());
    for parsed in config.parse_backends()? {
        let backend = Arc::new(Backend::new(parsed.url));
        backend.set_weight(parsed.weight);
        info!(
            backend = backend.key(),
            weight = backend.weight(),
            "backend_added"
        );
        pool.add(backend);
    }

    let strategy = build_strategy(&config.strategy);
    info!(strategy = strategy.name(), "strategy_selected");

    let retry = if config.retry.enabled {
        info!(
            max_attempts = config.retry.max_attempts,
            budget_percent = config.retry.budget_percent,
            "retry_enabled"
        );
        let budget = Arc::new(RetryBudget::new(config.retry.budget_percent));
        Some(RetryPolicy::new(config.retry.max_attempts, budget))
    } else {
        None
    };

    info!(
        timeout_seconds = config.request_timeout,
        "request_timeout_configured"
    );

    let breakers = Arc::new(CircuitRegistry::new());
    let router = Arc::new(Router::new(
        Arc::clone(&pool),
        strategy,
        PassiveTracker::new(PASSIVE_FAILURE_THRESHOLD),
        retry,
        Arc::clone(&breakers),
        config.request_timeout(),
    ));

    let prober = Arc::new(ActiveProber::new(
        Arc::clone(&pool),
        config.prober_config(),
    ));
    let prober_task = prober.start();

    let exporter_task = metrics::spawn_gauge_exporter(
        Arc::clone(&pool),
        Arc::clone(&breakers),
        router.retry_budget().cloned(),
    );

    let watcher_task = {
        let pool = Arc::clone(&pool);
        httplb::config::watcher::spawn(cli.config.clone(), move |new_config| {
            apply_reload(&pool, &new_config)
        })
    };

    let drain = CancelToken::new();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let server = ProxyServer::bind(addr, Arc::clone(&router), metrics_handle, drain.clone())
        .await
        .context("failed to start proxy server")?;
    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown_signal_received");

    // In-flight requests see the drain token at their next attempt
    // boundary; background loops are simply torn down.
    drain.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    prober_task.abort();
    exporter_task.abort();
    watcher_task.abort();
    server_task.abort();

    info!("shutdown_complete");
    Ok(())
}

fn build_strategy(name: &str) -> Box<dyn Strategy> {
    match name {
        "round-robin" => Box::new(RoundRobin::new()),
        "weighted-round-robin" => Box::new(WeightedRoundRobin::new()),
        "least-connections" => Box::new(LeastConnections::new()),
        other => {
            warn!(strategy = other, "unknown_strategy_using_round_robin");
            Box::new(RoundRobin::new())
        }
    }
}

/// Reload callback: builds fresh backends from the new config and swaps
/// them into the pool. Health state of surviving keys carries over;
/// strategy tables reconcile on the next selection and circuit breakers
/// keep their entries.
fn apply_reload(pool: &Pool, config: &Config) -> Result<()> {
    info!("applying_config_reload");

    let mut backends = Vec::new();
    for parsed in config.parse_backends()? {
        let backend = Arc::new(Backend::new(parsed.url));
        backend.set_weight(parsed.weight);
        info!(
            backend = backend.key(),
            weight = backend.weight(),
            "backend_configured"
        );
        backends.push(backend);
    }

    let count = backends.len();
    pool.replace(backends);
    info!(count, "backends_reloaded");
    Ok(())
}

//! httplb - HTTP/1.1 reverse proxy with health-aware load balancing

pub mod circuit;
pub mod config;
pub mod lb;
pub mod metrics;
pub mod proxy;
pub mod retry;

pub use config::Config;
pub use proxy::{ProxyServer, Router};

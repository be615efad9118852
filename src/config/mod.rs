pub mod watcher;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::lb::health::ProberConfig;

/// Top-level proxy configuration, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Port the proxy listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upstream servers with optional weights.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    /// Balancing strategy: round-robin, weighted-round-robin, or
    /// least-connections. Unknown values fall back to round-robin.
    #[serde(default = "default_strategy")]
    pub strategy: String,

    /// Per-request upstream timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// A single backend entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,

    /// Weight for weighted strategies; clamped to [1, 100].
    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// Active health-check parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between probe sweeps.
    #[serde(default = "default_health_interval")]
    pub interval: u64,

    /// Per-probe timeout in seconds.
    #[serde(default = "default_health_timeout")]
    pub timeout: u64,

    /// Consecutive successes to promote a backend.
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,

    /// Consecutive failures to demote a backend.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Path probed on every backend.
    #[serde(default = "default_health_path")]
    pub path: String,
}

/// Retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Total attempts per request (original + retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Percentage of observed traffic that may be retries, in [1, 100].
    #[serde(default = "default_budget_percent")]
    pub budget_percent: u32,
}

fn default_port() -> u16 {
    8080
}

fn default_strategy() -> String {
    "round-robin".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> u64 {
    5
}

fn default_health_timeout() -> u64 {
    3
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_budget_percent() -> u32 {
    10
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval: default_health_interval(),
            timeout: default_health_timeout(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            path: default_health_path(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: default_max_attempts(),
            budget_percent: default_budget_percent(),
        }
    }
}

/// A backend entry with its URL resolved and weight clamped.
#[derive(Debug, Clone)]
pub struct ParsedBackend {
    pub url: Url,
    pub weight: u32,
}

impl Config {
    /// Reads and validates the YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            serde_yaml::from_str(&content).context("failed to parse YAML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Structural validation: at least one backend, a positive total
    /// weight, every URL parseable. Weights are summed as written, so
    /// an all-zero list is rejected here rather than silently rescued
    /// by the clamping in `parse_backends`.
    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            anyhow::bail!("no backends configured");
        }
        let total_weight: u64 = self.backends.iter().map(|b| u64::from(b.weight)).sum();
        if total_weight == 0 {
            anyhow::bail!("total backend weight is zero");
        }
        for backend in &self.backends {
            Url::parse(&backend.url)
                .with_context(|| format!("invalid backend url: {}", backend.url))?;
        }
        Ok(())
    }

    /// Resolves backend entries into URLs with clamped weights.
    pub fn parse_backends(&self) -> Result<Vec<ParsedBackend>> {
        self.backends
            .iter()
            .map(|b| {
                let url = Url::parse(&b.url)
                    .with_context(|| format!("invalid backend url: {}", b.url))?;
                Ok(ParsedBackend {
                    url,
                    weight: b.weight.clamp(1, 100),
                })
            })
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn prober_config(&self) -> ProberConfig {
        ProberConfig {
            enabled: self.health_check.enabled,
            interval: Duration::from_secs(self.health_check.interval),
            timeout: Duration::from_secs(self.health_check.timeout),
            healthy_threshold: self.health_check.healthy_threshold,
            unhealthy_threshold: self.health_check.unhealthy_threshold,
            path: self.health_check.path.clone(),
        }
    }
}

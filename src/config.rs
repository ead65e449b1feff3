//! Configuration module for the recon engine
//!
//! One [`ReconConfig`] is built at process start (defaults, then an optional
//! TOML file, then command-line overrides) and handed to the orchestrator.
//! Nothing in the library reads configuration from global state.

use crate::error::{ReconError, ReconResult};
use crate::ratelimit::{RateLimitRule, RateLimiter};
use crate::session::RetryPolicy;
use crate::target::DEFAULT_MAX_EXPANSION;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name, looked up in the home directory
pub const DEFAULT_CONFIG_FILE: &str = ".recon.toml";

/// Main configuration structure for a recon run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    /// Comma-separated targets (addresses, CIDR blocks, domains, URLs)
    pub targets: String,

    /// Probes to start, by name
    pub probes: Vec<String>,

    /// Ports checked by the reachability probe
    pub ports: Vec<u16>,

    /// Worker tasks per probe
    pub concurrency: usize,

    /// Per-attempt timeout in milliseconds
    pub timeout_ms: u64,

    /// Additional attempts after the first one
    pub retries: u32,

    /// Delay between attempts in milliseconds
    pub retry_interval_ms: u64,

    /// Default admissions per window for every probe key; 0 means unlimited
    pub rate_limit: u32,

    /// Rate limit window in milliseconds
    pub rate_limit_window_ms: u64,

    /// Per-key overrides of the default rate limit
    pub rate_limits: Vec<RateLimitRule>,

    /// How long `stop` waits for running pools before aborting them
    pub stop_grace_ms: u64,

    /// Largest CIDR block that may be expanded
    pub max_expansion: u64,

    /// Timeout for name resolution in milliseconds
    pub resolve_timeout_ms: u64,

    /// Log level used when RUST_LOG is not set
    pub log_level: String,
}

impl Default for ReconConfig {
    fn default() -> Self {
        Self {
            targets: String::new(),
            probes: vec!["reachability".to_string()],
            ports: vec![21, 22, 23, 25, 53, 80, 110, 143, 443, 445, 3389, 5900, 8080, 8443],
            concurrency: 100,
            timeout_ms: 1500,
            retries: 2,
            retry_interval_ms: 500,
            rate_limit: 0,
            rate_limit_window_ms: 1000,
            rate_limits: Vec::new(),
            stop_grace_ms: 5000,
            max_expansion: DEFAULT_MAX_EXPANSION,
            resolve_timeout_ms: 3000,
            log_level: "info".to_string(),
        }
    }
}

impl ReconConfig {
    /// Create a new configuration for the given targets
    pub fn new(targets: impl Into<String>) -> Self {
        Self {
            targets: targets.into(),
            ..Default::default()
        }
    }

    pub fn with_probes(mut self, probes: Vec<String>) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: u32, window: Duration) -> Self {
        self.rate_limit = rate_limit;
        self.rate_limit_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_rate_rule(mut self, rule: RateLimitRule) -> Self {
        self.rate_limits.push(rule);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Retry policy derived from the retry and timeout settings
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retries.saturating_add(1),
            interval: Duration::from_millis(self.retry_interval_ms),
            per_attempt_timeout: self.timeout(),
        }
    }

    /// Default rule applied to every key without an override
    pub fn default_rate_rule(&self) -> RateLimitRule {
        if self.rate_limit == 0 {
            RateLimitRule::unlimited("default")
        } else {
            RateLimitRule::new(
                "default",
                self.rate_limit,
                Duration::from_millis(self.rate_limit_window_ms),
            )
        }
    }

    /// Build the shared rate limiter with every configured override
    pub fn rate_limiter(&self) -> ReconResult<RateLimiter> {
        self.rate_limits
            .iter()
            .cloned()
            .try_fold(RateLimiter::new(self.default_rate_rule())?, |limiter, rule| {
                limiter.with_rule(rule)
            })
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> ReconResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ReconError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ReconResult<Self> {
        let config: ReconConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Path of the per-user configuration file
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(DEFAULT_CONFIG_FILE))
    }

    /// Load `~/.recon.toml` when present, defaults otherwise
    pub fn load_default_config() -> ReconResult<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                log::info!("Loaded config from {}", path.display());
                Self::from_toml_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> ReconResult<()> {
        if self.concurrency == 0 {
            return Err(ReconError::Config(
                "Concurrency must be greater than 0".to_string(),
            ));
        }

        if self.timeout_ms == 0 {
            return Err(ReconError::Config("Timeout must be greater than 0".to_string()));
        }

        if self.rate_limit > 0 && self.rate_limit_window_ms == 0 {
            return Err(ReconError::Config(
                "Rate limit window must be greater than 0".to_string(),
            ));
        }

        if self.probes.is_empty() {
            return Err(ReconError::Config("No probes selected".to_string()));
        }

        if self.max_expansion == 0 {
            return Err(ReconError::Config(
                "Expansion limit must be greater than 0".to_string(),
            ));
        }

        for rule in &self.rate_limits {
            rule.validate()?;
        }

        Ok(())
    }
}

/// Serde helpers for durations stored as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

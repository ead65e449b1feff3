//! Keyed rate limiting
//!
//! Every probe source acquires from its own bucket, keyed by name. Each bucket
//! holds `capacity` tokens, and a consumed token comes back exactly one
//! `window` after it was taken. That is what guarantees at most `capacity`
//! admissions in any rolling window. Keys without an explicit rule get a
//! private bucket built from the default rule.

use crate::error::{ReconError, ReconResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Admission rule for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub key: String,
    #[serde(default)]
    pub capacity: u32,
    #[serde(default, with = "crate::config::duration_ms")]
    pub window: Duration,
    #[serde(default)]
    pub unlimited: bool,
}

impl RateLimitRule {
    pub fn new(key: impl Into<String>, capacity: u32, window: Duration) -> Self {
        Self {
            key: key.into(),
            capacity,
            window,
            unlimited: false,
        }
    }

    /// A rule that never blocks
    pub fn unlimited(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            capacity: 0,
            window: Duration::ZERO,
            unlimited: true,
        }
    }

    pub fn per_second(key: impl Into<String>, capacity: u32) -> Self {
        Self::new(key, capacity, Duration::from_secs(1))
    }

    /// Same limits under a different key
    pub fn for_key(&self, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> ReconResult<()> {
        if self.unlimited {
            return Ok(());
        }
        if self.capacity == 0 {
            return Err(ReconError::Config(format!(
                "Rate limit '{}' must admit at least one request per window",
                self.key
            )));
        }
        if self.window.is_zero() {
            return Err(ReconError::Config(format!(
                "Rate limit '{}' has an empty window",
                self.key
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Bucket {
    capacity: usize,
    window: Duration,
    unlimited: bool,
    /// Instants of admissions still inside the window, oldest first
    issued: VecDeque<Instant>,
}

impl Bucket {
    fn from_rule(rule: &RateLimitRule) -> Self {
        Self {
            capacity: rule.capacity as usize,
            window: rule.window,
            unlimited: rule.unlimited,
            issued: VecDeque::with_capacity(rule.capacity.min(1024) as usize),
        }
    }

    fn refill(&mut self, now: Instant) {
        while let Some(&oldest) = self.issued.front() {
            if now.duration_since(oldest) >= self.window {
                self.issued.pop_front();
            } else {
                break;
            }
        }
    }

    /// Take a token, or report how long until the oldest one returns
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        if self.unlimited {
            return Ok(());
        }
        self.refill(now);
        if self.issued.len() < self.capacity {
            self.issued.push_back(now);
            return Ok(());
        }
        let oldest = self.issued.front().copied().unwrap_or(now);
        Err(self.window.saturating_sub(now.duration_since(oldest)))
    }

    fn available(&mut self, now: Instant) -> Option<u32> {
        if self.unlimited {
            return None;
        }
        self.refill(now);
        Some((self.capacity - self.issued.len()) as u32)
    }
}

/// Token-bucket admission gate shared by every probe of a run
#[derive(Debug)]
pub struct RateLimiter {
    default_rule: RateLimitRule,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Create a limiter whose unconfigured keys follow `default_rule`
    pub fn new(default_rule: RateLimitRule) -> ReconResult<Self> {
        default_rule.validate()?;
        Ok(Self {
            default_rule,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    /// A limiter that admits everything
    pub fn unlimited() -> Self {
        Self {
            default_rule: RateLimitRule::unlimited("default"),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Add a rule while the limiter is still exclusively owned
    pub fn with_rule(mut self, rule: RateLimitRule) -> ReconResult<Self> {
        rule.validate()?;
        let buckets = self.buckets.get_mut();
        if buckets.contains_key(&rule.key) {
            return Err(duplicate_rule(&rule.key));
        }
        buckets.insert(rule.key.clone(), Bucket::from_rule(&rule));
        Ok(self)
    }

    /// Add a rule to a shared limiter; an existing key is an error
    pub async fn add_rule(&self, rule: RateLimitRule) -> ReconResult<()> {
        rule.validate()?;
        let mut buckets = self.buckets.lock().await;
        if buckets.contains_key(&rule.key) {
            return Err(duplicate_rule(&rule.key));
        }
        log::debug!(
            "Rate limit for '{}': {} per {:?}{}",
            rule.key,
            rule.capacity,
            rule.window,
            if rule.unlimited { " (unlimited)" } else { "" }
        );
        buckets.insert(rule.key.clone(), Bucket::from_rule(&rule));
        Ok(())
    }

    pub async fn has_rule(&self, key: &str) -> bool {
        self.buckets.lock().await.contains_key(key)
    }

    /// Wait until `key` has a token. A cancelled scope unblocks the caller
    /// with [`ReconError::Cancelled`].
    pub async fn acquire(&self, key: &str, cancel: &CancellationToken) -> ReconResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(ReconError::Cancelled);
            }

            let wait = {
                let mut buckets = self.buckets.lock().await;
                match self.bucket(&mut buckets, key).try_take(Instant::now()) {
                    Ok(()) => return Ok(()),
                    Err(wait) => wait,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Rate limit wait for '{}' cancelled", key);
                    return Err(ReconError::Cancelled);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Take a token only if one is available right now
    pub async fn try_acquire(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().await;
        self.bucket(&mut buckets, key).try_take(Instant::now()).is_ok()
    }

    /// Tokens currently available for `key`; `None` when unlimited
    pub async fn available(&self, key: &str) -> Option<u32> {
        let mut buckets = self.buckets.lock().await;
        self.bucket(&mut buckets, key).available(Instant::now())
    }

    fn bucket<'a>(&self, buckets: &'a mut HashMap<String, Bucket>, key: &str) -> &'a mut Bucket {
        buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::from_rule(&self.default_rule.for_key(key)))
    }
}

fn duplicate_rule(key: &str) -> ReconError {
    ReconError::Config(format!("Rate limit for '{}' is already configured", key))
}

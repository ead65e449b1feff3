//! Result deduplication and deterministic ordering
//!
//! Scheduling order is never relied on: an [`Aggregator`] keeps one result
//! per key (first seen, unless a reducer says otherwise) and then applies a
//! stable sort, so ties keep their first-seen order.

use crate::probe::ProbeResult;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// Normalizes a result to its deduplication key
pub type KeyFn = Arc<dyn Fn(&ProbeResult) -> String + Send + Sync>;

/// Comparator defining report order
pub type OrderFn = Arc<dyn Fn(&ProbeResult, &ProbeResult) -> Ordering + Send + Sync>;

/// Verdict of a custom reducer on a duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    KeepExisting,
    Replace,
}

/// Rule for picking among results with the same key
#[derive(Clone)]
pub enum Reducer {
    FirstSeen,
    Custom(Arc<dyn Fn(&ProbeResult, &ProbeResult) -> Choice + Send + Sync>),
}

impl Reducer {
    /// `pick(existing, candidate)` decides which duplicate survives
    pub fn custom<F>(pick: F) -> Self
    where
        F: Fn(&ProbeResult, &ProbeResult) -> Choice + Send + Sync + 'static,
    {
        Reducer::Custom(Arc::new(pick))
    }

    fn choose(&self, existing: &ProbeResult, candidate: &ProbeResult) -> Choice {
        match self {
            Reducer::FirstSeen => Choice::KeepExisting,
            Reducer::Custom(pick) => pick(existing, candidate),
        }
    }
}

impl Default for Reducer {
    fn default() -> Self {
        Reducer::FirstSeen
    }
}

impl std::fmt::Debug for Reducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reducer::FirstSeen => f.write_str("FirstSeen"),
            Reducer::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Clone)]
pub struct Aggregator {
    key: KeyFn,
    reducer: Reducer,
    order: Option<OrderFn>,
    findings_only: bool,
}

impl Aggregator {
    pub fn new<F>(key: F) -> Self
    where
        F: Fn(&ProbeResult) -> String + Send + Sync + 'static,
    {
        Self {
            key: Arc::new(key),
            reducer: Reducer::FirstSeen,
            order: None,
            findings_only: false,
        }
    }

    pub fn with_reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn with_order<F>(mut self, order: F) -> Self
    where
        F: Fn(&ProbeResult, &ProbeResult) -> Ordering + Send + Sync + 'static,
    {
        self.order = Some(Arc::new(order));
        self
    }

    /// Drop failures and empty results before deduplicating
    pub fn findings_only(mut self) -> Self {
        self.findings_only = true;
        self
    }

    /// Open ports keyed by `ip:port`, insecure first, then ascending port
    pub fn port_scan() -> Self {
        Self::new(keys::ip_port)
            .findings_only()
            .with_order(order::insecure_first_then_port)
    }

    pub fn key_of(&self, result: &ProbeResult) -> String {
        (self.key)(result)
    }

    pub fn aggregate<I>(&self, results: I) -> Vec<ProbeResult>
    where
        I: IntoIterator<Item = ProbeResult>,
    {
        let mut kept: Vec<ProbeResult> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for result in results {
            if self.findings_only && !result.is_finding() {
                continue;
            }
            let key = self.key_of(&result);
            match index.get(&key) {
                Some(&slot) => {
                    if self.reducer.choose(&kept[slot], &result) == Choice::Replace {
                        kept[slot] = result;
                    }
                }
                None => {
                    index.insert(key, kept.len());
                    kept.push(result);
                }
            }
        }

        if let Some(order) = &self.order {
            kept.sort_by(|a, b| order(a, b));
        }
        kept
    }
}

/// Reference key functions
pub mod keys {
    use crate::probe::{Payload, ProbeResult};

    /// Case-insensitive host of the target
    pub fn lowercase_host(result: &ProbeResult) -> String {
        result.target.host().to_lowercase()
    }

    /// `ip:port` of a port finding, falling back to the target host
    pub fn ip_port(result: &ProbeResult) -> String {
        match result.port_status() {
            Some(status) => std::net::SocketAddr::new(status.address, status.port).to_string(),
            None => match result.payload() {
                Some(Payload::Http(http)) => http.url.to_lowercase(),
                _ => lowercase_host(result),
            },
        }
    }

    /// One result per probe and target
    pub fn source_and_target(result: &ProbeResult) -> String {
        format!("{}|{}", result.source, result.target)
    }
}

/// Reference order policies
pub mod order {
    use crate::probe::ProbeResult;
    use std::cmp::Ordering;

    /// Insecure ports before everything else, then ascending port.
    /// Results without a port sort last.
    pub fn insecure_first_then_port(a: &ProbeResult, b: &ProbeResult) -> Ordering {
        let rank = |r: &ProbeResult| match r.port_status() {
            Some(status) => (if status.insecure { 0 } else { 1 }, status.port),
            None => (2, 0),
        };
        rank(a).cmp(&rank(b))
    }

    /// Target value, then probe name
    pub fn by_target(a: &ProbeResult, b: &ProbeResult) -> Ordering {
        a.target
            .value()
            .cmp(b.target.value())
            .then_with(|| a.source.cmp(&b.source))
    }
}

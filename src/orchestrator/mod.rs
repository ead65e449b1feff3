//! Run orchestrator
//!
//! Holds the probe registry, starts one worker pool per probe over a shared
//! merge stream, and owns the run's single cancellation scope. State moves
//! `Idle -> Running -> Draining -> Stopped` and never goes back.

use crate::config::ReconConfig;
use crate::error::{ReconError, ReconResult};
use crate::pool::{PoolStats, WorkerPool};
use crate::probe::{Probe, ProbeResult};
use crate::ratelimit::RateLimiter;
use crate::target::Target;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle state of the orchestrator and of each probe run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

struct Registration {
    probe: Arc<dyn Probe>,
    state: RunState,
    stats: Option<PoolStats>,
}

/// Completion of one started pool; `None` when the pool failed or was aborted
type PoolDone = Shared<BoxFuture<'static, Option<PoolStats>>>;

#[derive(Clone)]
struct PoolEntry {
    name: String,
    done: PoolDone,
    abort: AbortHandle,
}

struct Inner {
    state: RunState,
    probes: HashMap<String, Registration>,
    pools: Vec<PoolEntry>,
}

pub struct Orchestrator {
    run_id: Uuid,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    concurrency: usize,
    sender: mpsc::UnboundedSender<ProbeResult>,
    results: Mutex<mpsc::UnboundedReceiver<ProbeResult>>,
    inner: Mutex<Inner>,
}

impl Orchestrator {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        let (sender, results) = mpsc::unbounded_channel();
        Self {
            run_id: Uuid::new_v4(),
            limiter,
            cancel: CancellationToken::new(),
            concurrency: ReconConfig::default().concurrency,
            sender,
            results: Mutex::new(results),
            inner: Mutex::new(Inner {
                state: RunState::Idle,
                probes: HashMap::new(),
                pools: Vec::new(),
            }),
        }
    }

    pub fn from_config(config: &ReconConfig) -> ReconResult<Self> {
        config.validate()?;
        Ok(Self::new(Arc::new(config.rate_limiter()?)).with_concurrency(config.concurrency))
    }

    /// Worker tasks per started pool
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn register(&self, probe: Arc<dyn Probe>) -> ReconResult<()> {
        let name = probe.name().to_string();
        let mut inner = self.inner.lock().await;
        if inner.probes.contains_key(&name) {
            return Err(ReconError::DuplicateProbe(name));
        }
        log::debug!("[{}] Registered probe {}", self.run_id, name);
        inner.probes.insert(
            name,
            Registration {
                probe,
                state: RunState::Idle,
                stats: None,
            },
        );
        Ok(())
    }

    pub async fn probe_names(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut names: Vec<String> = inner.probes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start one worker pool for `name` over `targets`
    pub async fn start(&self, name: &str, targets: Vec<Target>) -> ReconResult<()> {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, RunState::Draining | RunState::Stopped) {
            return Err(ReconError::OrchestratorStopped);
        }

        let registration = inner
            .probes
            .get_mut(name)
            .ok_or_else(|| ReconError::UnknownProbe(name.to_string()))?;
        if registration.state != RunState::Idle {
            return Err(ReconError::ProbeAlreadyStarted(name.to_string()));
        }

        let count = targets.len();
        let pool = WorkerPool::new(self.concurrency)?;
        let join = pool.run_into(
            targets,
            registration.probe.clone(),
            self.cancel.clone(),
            self.sender.clone(),
        )?;
        registration.state = RunState::Running;

        let abort = join.abort_handle();
        let run_id = self.run_id;
        let pool_name = name.to_string();
        let done = join
            .map(move |joined| match joined {
                Ok(stats) => Some(stats),
                Err(e) if e.is_cancelled() => None,
                Err(e) => {
                    log::error!("[{}] Pool for {} failed: {}", run_id, pool_name, e);
                    None
                }
            })
            .boxed()
            .shared();

        inner.state = RunState::Running;
        inner.pools.push(PoolEntry {
            name: name.to_string(),
            done,
            abort,
        });
        log::info!("[{}] Started {} on {} targets", self.run_id, name, count);
        Ok(())
    }

    /// Everything buffered in the merge stream right now; never waits
    pub async fn results(&self) -> Vec<ProbeResult> {
        let mut stream = self.results.lock().await;
        let mut drained = Vec::new();
        while let Ok(result) = stream.try_recv() {
            drained.push(result);
        }
        drained
    }

    pub async fn state(&self) -> RunState {
        self.inner.lock().await.state
    }

    pub async fn probe_state(&self, name: &str) -> Option<RunState> {
        self.inner.lock().await.probes.get(name).map(|r| r.state)
    }

    /// Join-barrier counters of a finished probe run
    pub async fn stats(&self, name: &str) -> Option<PoolStats> {
        self.inner
            .lock()
            .await
            .probes
            .get(name)
            .and_then(|r| r.stats.clone())
    }

    /// Wait for every started pool to finish, then stop.
    ///
    /// Safe to run alongside [`Orchestrator::stop_all`]: pools it aborts
    /// count as finished here.
    pub async fn wait(&self) {
        let pools = {
            let inner = self.inner.lock().await;
            if inner.state == RunState::Stopped {
                return;
            }
            inner.pools.clone()
        };

        let mut finished = Vec::with_capacity(pools.len());
        for entry in pools {
            finished.push((entry.name, entry.done.await));
        }
        self.finish(finished).await;
    }

    /// Cancel the run and wait up to `grace` for started pools.
    ///
    /// Pools still running at the deadline are aborted. A second call, or a
    /// call racing an ongoing stop, returns at once.
    pub async fn stop_all(&self, grace: Duration) {
        let pools = {
            let mut inner = self.inner.lock().await;
            if matches!(inner.state, RunState::Draining | RunState::Stopped) {
                return;
            }
            inner.state = RunState::Draining;
            for registration in inner.probes.values_mut() {
                if registration.state == RunState::Running {
                    registration.state = RunState::Draining;
                }
            }
            inner.pools.clone()
        };

        log::info!("[{}] Stopping {} pool(s)", self.run_id, pools.len());
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        let mut finished = Vec::with_capacity(pools.len());
        for entry in pools {
            match tokio::time::timeout_at(deadline, entry.done.clone()).await {
                Ok(stats) => finished.push((entry.name, stats)),
                Err(_) => {
                    log::warn!(
                        "[{}] Pool for {} missed the {:?} grace period, aborting",
                        self.run_id,
                        entry.name,
                        grace
                    );
                    entry.abort.abort();
                    finished.push((entry.name, None));
                }
            }
        }
        self.finish(finished).await;
    }

    async fn finish(&self, finished: Vec<(String, Option<PoolStats>)>) {
        let mut inner = self.inner.lock().await;
        for (name, stats) in finished {
            if let Some(registration) = inner.probes.get_mut(&name) {
                registration.state = RunState::Stopped;
                if stats.is_some() {
                    registration.stats = stats;
                }
            }
        }
        if inner.state != RunState::Stopped {
            inner.state = RunState::Stopped;
            log::info!("[{}] Run stopped", self.run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeDescriptor, ResultSink};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct Sleepy {
        name: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl Probe for Sleepy {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(
            &self,
            _target: &Target,
            sink: &ResultSink,
            _cancel: &CancellationToken,
        ) -> ReconResult<()> {
            tokio::time::sleep(self.delay).await;
            sink.empty();
            Ok(())
        }
    }

    /// Ignores cancellation and counts invocations that ran to the end
    struct Stubborn {
        isolation: bool,
        completed: AtomicUsize,
    }

    #[async_trait]
    impl Probe for Stubborn {
        fn name(&self) -> &str {
            "stubborn"
        }

        fn descriptor(&self) -> ProbeDescriptor {
            ProbeDescriptor::new(self.name()).with_isolation(self.isolation)
        }

        async fn run(
            &self,
            _target: &Target,
            sink: &ResultSink,
            _cancel: &CancellationToken,
        ) -> ReconResult<()> {
            tokio::time::sleep(Duration::from_millis(600)).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            sink.empty();
            Ok(())
        }
    }

    fn sleepy(name: &'static str, millis: u64) -> Arc<Sleepy> {
        Arc::new(Sleepy {
            name,
            delay: Duration::from_millis(millis),
        })
    }

    fn targets(n: usize) -> Vec<Target> {
        (0..n)
            .map(|i| Target::address(format!("10.0.{}.{}", i / 250, i % 250 + 1).parse().unwrap()))
            .collect()
    }

    fn orchestrator(concurrency: usize) -> Orchestrator {
        Orchestrator::new(Arc::new(RateLimiter::unlimited())).with_concurrency(concurrency)
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let orchestrator = orchestrator(1);
        orchestrator.register(sleepy("b", 0)).await.unwrap();
        orchestrator.register(sleepy("a", 0)).await.unwrap();
        assert!(matches!(
            orchestrator.register(sleepy("a", 0)).await,
            Err(ReconError::DuplicateProbe(_))
        ));
        assert_eq!(orchestrator.probe_names().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_start_errors() {
        let orchestrator = orchestrator(1);
        orchestrator.register(sleepy("a", 0)).await.unwrap();
        assert!(matches!(
            orchestrator.start("missing", targets(1)).await,
            Err(ReconError::UnknownProbe(_))
        ));

        orchestrator.start("a", targets(1)).await.unwrap();
        assert!(matches!(
            orchestrator.start("a", targets(1)).await,
            Err(ReconError::ProbeAlreadyStarted(_))
        ));

        orchestrator.wait().await;
        assert!(matches!(
            orchestrator.start("a", targets(1)).await,
            Err(ReconError::OrchestratorStopped)
        ));
    }

    #[tokio::test]
    async fn test_parallel_probes_merge_into_one_stream() {
        let orchestrator = orchestrator(4);
        orchestrator.register(sleepy("a", 1)).await.unwrap();
        orchestrator.register(sleepy("b", 1)).await.unwrap();
        assert_eq!(orchestrator.state().await, RunState::Idle);

        orchestrator.start("a", targets(10)).await.unwrap();
        orchestrator.start("b", targets(10)).await.unwrap();
        assert_eq!(orchestrator.state().await, RunState::Running);

        orchestrator.wait().await;
        let results = orchestrator.results().await;
        assert_eq!(results.len(), 20);
        assert_eq!(results.iter().filter(|r| r.source == "a").count(), 10);
        assert_eq!(orchestrator.state().await, RunState::Stopped);
        assert_eq!(orchestrator.probe_state("a").await, Some(RunState::Stopped));
        assert_eq!(orchestrator.stats("b").await.unwrap().processed, 10);
    }

    #[tokio::test]
    async fn test_results_does_not_block() {
        let orchestrator = orchestrator(1);
        orchestrator.register(sleepy("slow", 10_000)).await.unwrap();
        orchestrator.start("slow", targets(1)).await.unwrap();

        let started = Instant::now();
        assert!(orchestrator.results().await.is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
        orchestrator.stop_all(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_stop_all_abandons_queue_and_is_idempotent() {
        let orchestrator = orchestrator(1);
        orchestrator.register(sleepy("slow", 50)).await.unwrap();
        orchestrator.start("slow", targets(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let started = Instant::now();
        orchestrator.stop_all(Duration::from_secs(2)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(orchestrator.state().await, RunState::Stopped);

        let stats = orchestrator.stats("slow").await.unwrap();
        assert!(stats.skipped > 0);
        assert_eq!(stats.processed + stats.skipped, 100);
        assert!(orchestrator.results().await.len() < 100);

        let again = Instant::now();
        orchestrator.stop_all(Duration::from_secs(2)).await;
        assert!(again.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_stop_all_aborts_after_grace() {
        let orchestrator = orchestrator(1);
        orchestrator.register(sleepy("stuck", 60_000)).await.unwrap();
        orchestrator.start("stuck", targets(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        orchestrator.stop_all(Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(orchestrator.probe_state("stuck").await, Some(RunState::Stopped));
        assert!(orchestrator.stats("stuck").await.is_none());
    }

    #[tokio::test]
    async fn test_aborted_pools_stop_emitting() {
        for isolation in [false, true] {
            let orchestrator = orchestrator(2);
            let probe = Arc::new(Stubborn {
                isolation,
                completed: AtomicUsize::new(0),
            });
            orchestrator.register(probe.clone()).await.unwrap();
            orchestrator.start("stubborn", targets(2)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;

            orchestrator.stop_all(Duration::from_millis(100)).await;
            assert_eq!(orchestrator.state().await, RunState::Stopped);

            // Past the point where the invocations would have finished
            tokio::time::sleep(Duration::from_millis(900)).await;
            assert_eq!(probe.completed.load(Ordering::SeqCst), 0);
            assert!(orchestrator.results().await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_stop_from_another_task() {
        let orchestrator = Arc::new(orchestrator(2));
        orchestrator.register(sleepy("a", 20)).await.unwrap();
        orchestrator.start("a", targets(50)).await.unwrap();

        let stopper = orchestrator.clone();
        tokio::spawn(async move { stopper.stop_all(Duration::from_secs(1)).await })
            .await
            .unwrap();
        assert_eq!(orchestrator.state().await, RunState::Stopped);
        assert!(orchestrator.cancellation_token().is_cancelled());
    }
}

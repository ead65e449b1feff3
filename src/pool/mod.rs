//! Bounded-concurrency worker pool
//!
//! Every target is queued up front into a channel sized to the full target
//! count, then exactly `min(concurrency, targets)` workers drain it. Each
//! target yields at least one [`ProbeResult`]: the probe's own findings, a
//! failure carrying the probe's error, or an empty "no finding" record.

use crate::config::duration_ms;
use crate::error::{ReconError, ReconResult};
use crate::probe::{Probe, ProbeResult, ResultSink};
use crate::target::{Target, TargetKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Counters reported by a pool's join barrier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub targets: usize,
    /// Targets handed to the probe
    pub processed: usize,
    /// Invocations that ended in an error or a panic
    pub failures: usize,
    /// In-flight invocations interrupted by cancellation
    pub cancelled: usize,
    /// Queued targets never handed to the probe
    pub skipped: usize,
    pub worker_panics: usize,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

/// Result stream and join barrier of a spawned pool
pub struct PoolHandle {
    pub results: mpsc::UnboundedReceiver<ProbeResult>,
    pub join: JoinHandle<PoolStats>,
}

impl PoolHandle {
    /// Drain the result stream until every worker has returned
    pub async fn collect(mut self) -> ReconResult<(Vec<ProbeResult>, PoolStats)> {
        let mut results = Vec::new();
        while let Some(result) = self.results.recv().await {
            results.push(result);
        }
        let stats = self
            .join
            .await
            .map_err(|e| ReconError::Probe {
                probe: "pool".to_string(),
                message: format!("pool task failed: {}", e),
            })?;
        Ok((results, stats))
    }
}

#[derive(Debug, Default)]
struct WorkerTally {
    processed: usize,
    failures: usize,
    cancelled: usize,
    skipped: usize,
}

/// How one invocation ended
enum Invocation {
    Completed,
    Failed,
    Cancelled,
}

/// Aborts the isolated invocation if the worker is dropped mid-run
struct Isolated(JoinHandle<ReconResult<()>>);

impl Drop for Isolated {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    pub fn new(concurrency: usize) -> ReconResult<Self> {
        if concurrency == 0 {
            return Err(ReconError::Config(
                "Concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self { concurrency })
    }

    /// Reject target lists the probe could never run, before anything is spawned
    pub fn validate(targets: &[Target], probe: &dyn Probe) -> ReconResult<()> {
        for target in targets {
            if target.kind() == TargetKind::Range {
                return Err(ReconError::InvalidRange(format!(
                    "{} must be expanded before scheduling",
                    target
                )));
            }
            if !probe.accepts(target.kind()) {
                return Err(ReconError::InvalidAddress(format!(
                    "{} target {} is not accepted by probe {}",
                    target.kind(),
                    target,
                    probe.name()
                )));
            }
        }
        Ok(())
    }

    /// Spawn the pool with its own result stream, closed once every worker returns
    pub fn spawn(
        &self,
        targets: Vec<Target>,
        probe: Arc<dyn Probe>,
        cancel: CancellationToken,
    ) -> ReconResult<PoolHandle> {
        let (sender, results) = mpsc::unbounded_channel();
        let join = self.run_into(targets, probe, cancel, sender)?;
        Ok(PoolHandle { results, join })
    }

    /// Spawn the pool feeding an existing stream
    pub fn run_into(
        &self,
        targets: Vec<Target>,
        probe: Arc<dyn Probe>,
        cancel: CancellationToken,
        sender: mpsc::UnboundedSender<ProbeResult>,
    ) -> ReconResult<JoinHandle<PoolStats>> {
        Self::validate(&targets, probe.as_ref())?;

        let total = targets.len();
        let workers = self.concurrency.min(total);
        let name = probe.name().to_string();
        let isolation = probe.descriptor().isolation;

        // Capacity equals the target count so these sends never wait
        let (queue_tx, queue_rx) = mpsc::channel(total.max(1));
        for target in targets {
            queue_tx
                .try_send(target)
                .map_err(|e| ReconError::Config(format!("Failed to queue target: {}", e)))?;
        }
        drop(queue_tx);
        let queue = Arc::new(Mutex::new(queue_rx));

        Ok(tokio::spawn(async move {
            let started = Instant::now();
            log::info!("[{}] Starting pool: {} targets, {} workers", name, total, workers);

            // Dropping the set aborts every worker, so aborting this task
            // tears the whole pool down
            let mut set = JoinSet::new();
            for id in 0..workers {
                set.spawn(worker(
                    id,
                    queue.clone(),
                    probe.clone(),
                    cancel.clone(),
                    sender.clone(),
                    isolation,
                ));
            }
            drop(sender);

            let mut stats = PoolStats {
                targets: total,
                ..PoolStats::default()
            };
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(tally) => {
                        stats.processed += tally.processed;
                        stats.failures += tally.failures;
                        stats.cancelled += tally.cancelled;
                        stats.skipped += tally.skipped;
                    }
                    Err(e) => {
                        log::error!("[{}] Worker task failed: {}", name, e);
                        stats.worker_panics += 1;
                    }
                }
            }

            let mut queue = queue.lock().await;
            while queue.try_recv().is_ok() {
                stats.skipped += 1;
            }
            stats.elapsed = started.elapsed();

            if stats.worker_panics > 0 && !cancel.is_cancelled() {
                log::error!(
                    "[{}] Pool lost {} of {} workers: {}/{} targets processed, {} left in queue",
                    name,
                    stats.worker_panics,
                    workers,
                    stats.processed,
                    total,
                    stats.skipped
                );
            } else if stats.skipped > 0 || stats.cancelled > 0 {
                log::info!(
                    "[{}] Pool cancelled: {}/{} targets processed, {} interrupted, {} skipped",
                    name,
                    stats.processed,
                    total,
                    stats.cancelled,
                    stats.skipped
                );
            } else {
                log::info!(
                    "[{}] Pool finished: {} targets, {} failures in {:.2}s",
                    name,
                    stats.processed,
                    stats.failures,
                    stats.elapsed.as_secs_f64()
                );
            }
            stats
        }))
    }

    /// Run to completion and return every result
    pub async fn collect(
        &self,
        targets: Vec<Target>,
        probe: Arc<dyn Probe>,
        cancel: CancellationToken,
    ) -> ReconResult<Vec<ProbeResult>> {
        let (results, _) = self.spawn(targets, probe, cancel)?.collect().await?;
        Ok(results)
    }
}

async fn worker(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Target>>>,
    probe: Arc<dyn Probe>,
    cancel: CancellationToken,
    sender: mpsc::UnboundedSender<ProbeResult>,
    isolation: bool,
) -> WorkerTally {
    let mut tally = WorkerTally::default();

    loop {
        if cancel.is_cancelled() {
            log::debug!("[{}] Worker {} stopping: cancelled", probe.name(), id);
            break;
        }
        let next = queue.lock().await.recv().await;
        let Some(target) = next else {
            break;
        };
        // Cancelled while waiting for the queue lock
        if cancel.is_cancelled() {
            log::debug!("[{}] Worker {} stopping: cancelled", probe.name(), id);
            tally.skipped += 1;
            break;
        }

        tally.processed += 1;
        match invoke(&probe, target, &sender, &cancel, isolation).await {
            Invocation::Completed => {}
            Invocation::Failed => tally.failures += 1,
            Invocation::Cancelled => tally.cancelled += 1,
        }
    }

    tally
}

async fn invoke(
    probe: &Arc<dyn Probe>,
    target: Target,
    sender: &mpsc::UnboundedSender<ProbeResult>,
    cancel: &CancellationToken,
    isolation: bool,
) -> Invocation {
    let sink = ResultSink::new(probe.name(), target.clone(), sender.clone());

    let outcome = if isolation {
        let mut task = {
            let probe = probe.clone();
            let sink = sink.clone();
            let cancel = cancel.clone();
            let target = target.clone();
            Isolated(tokio::spawn(async move {
                probe.run(&target, &sink, &cancel).await
            }))
        };
        match (&mut task.0).await {
            Ok(outcome) => outcome,
            Err(e) => Err(ReconError::probe(
                probe.name(),
                format!("probe panicked on {}: {}", target, e),
            )),
        }
    } else {
        probe.run(&target, &sink, cancel).await
    };

    match outcome {
        Ok(()) => {
            if sink.emitted() == 0 {
                sink.empty();
            }
            Invocation::Completed
        }
        Err(e) if e.is_cancellation() => {
            log::debug!("[{}] {} cancelled in flight", probe.name(), target);
            sink.failure(&e);
            Invocation::Cancelled
        }
        Err(e) => {
            log::debug!("[{}] {} failed: {}", probe.name(), target, e);
            sink.failure(&e);
            Invocation::Failed
        }
    }
}

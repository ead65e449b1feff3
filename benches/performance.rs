//! Performance benchmarks for the recon engine

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use recon_engine::probe::PortStatus;
use recon_engine::{
    expand, expand_list, Aggregator, Outcome, Payload, Probe, ProbeResult, ReconResult,
    ResultSink, Target, WorkerPool,
};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

/// Benchmark CIDR and list expansion
fn bench_expansion(c: &mut Criterion) {
    let mut group = c.benchmark_group("expansion");

    for prefix in [24u8, 20, 16] {
        group.bench_with_input(BenchmarkId::new("ipv4_cidr", prefix), &prefix, |b, &prefix| {
            let input = format!("10.0.0.0/{}", prefix);
            b.iter(|| black_box(expand(black_box(&input)).unwrap()))
        });
    }

    group.bench_function("mixed_list", |b| {
        let input = "example.com, 192.168.0.0/24, https://example.org/, 10.0.0.1, 10.0.0.1";
        b.iter(|| black_box(expand_list(black_box(input)).unwrap()))
    });

    group.finish();
}

fn port_results(n: usize) -> Vec<ProbeResult> {
    (0..n)
        .map(|i| {
            let port = (i % 2000) as u16 + 1;
            let address = std::net::Ipv4Addr::from(0x0a00_0000u32 + (i / 2000) as u32 + 1);
            ProbeResult::new(
                "reachability",
                Target::address(address.into()),
                Outcome::Finding(Payload::Port(PortStatus {
                    address: address.into(),
                    port,
                    open: true,
                    insecure: port % 7 == 0,
                    service: None,
                })),
            )
        })
        .collect()
}

/// Benchmark dedup and ordering
fn bench_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");

    for n in [1_000usize, 10_000, 50_000] {
        let mut results = port_results(n);
        // Every result twice so dedup has work to do
        results.extend(results.clone());
        group.bench_with_input(BenchmarkId::new("port_scan", n), &results, |b, results| {
            let aggregator = Aggregator::port_scan();
            b.iter(|| black_box(aggregator.aggregate(results.iter().cloned())))
        });
    }

    group.finish();
}

struct Noop;

#[async_trait]
impl Probe for Noop {
    fn name(&self) -> &str {
        "noop"
    }

    async fn run(
        &self,
        _target: &Target,
        sink: &ResultSink,
        _cancel: &CancellationToken,
    ) -> ReconResult<()> {
        sink.empty();
        Ok(())
    }
}

/// Benchmark scheduling overhead of the worker pool
fn bench_pool(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("worker_pool");
    let targets = expand("10.0.0.0/22").unwrap();

    for concurrency in [1usize, 16, 256] {
        group.bench_with_input(
            BenchmarkId::new("noop_1022_targets", concurrency),
            &concurrency,
            |b, &concurrency| {
                b.iter(|| {
                    rt.block_on(async {
                        let pool = WorkerPool::new(concurrency).unwrap();
                        let results = pool
                            .collect(targets.clone(), Arc::new(Noop), CancellationToken::new())
                            .await
                            .unwrap();
                        black_box(results)
                    })
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_expansion, bench_aggregation, bench_pool);

criterion_main!(benches);

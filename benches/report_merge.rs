//! Report merge and wire codec benchmarks
//!
//! The app folds every report in its window on each read, so merge cost
//! bounds how fast `/api/report` can answer.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use periscope_common::codec::{self, Encoding};
use periscope_common::report::topology;
use periscope_common::{Node, Report};
use std::hint::black_box as bb;

fn probe_report(probe: usize, processes: usize) -> Report {
    let mut report = Report::new();
    let host = format!("host;probe-{}", probe);
    report
        .topology_mut(topology::HOST)
        .add_node(Node::new(host.clone()).with_set("probe", [format!("probe-{}", probe)]));

    let procs = report.topology_mut(topology::PROCESS);
    for pid in 0..processes {
        // Half the pids overlap between probes so merges do real work.
        let id = format!("proc;{}", pid % (processes / 2).max(1));
        procs.add_node(
            Node::new(id)
                .with_set("host", [host.clone()])
                .with_adjacent(format!("proc;{}", (pid + 1) % processes)),
        );
    }
    report
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("report_merge");
    for size in [10, 100, 1000] {
        let a = probe_report(1, size);
        let b = probe_report(2, size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |bench, _| {
            bench.iter(|| bb(a.merged(bb(&b))));
        });
    }
    group.finish();
}

fn bench_window_fold(c: &mut Criterion) {
    // 15s window at one report per second from five probes
    let reports: Vec<Report> = (0..75).map(|i| probe_report(i % 5, 200)).collect();
    c.bench_function("window_fold_75x200", |bench| {
        bench.iter(|| {
            let mut acc = Report::new();
            for report in &reports {
                acc.merge(bb(report));
            }
            bb(acc)
        });
    });
}

fn bench_codec(c: &mut Criterion) {
    let report = probe_report(1, 1000);
    let mut group = c.benchmark_group("report_codec");
    for encoding in [Encoding::Json, Encoding::JsonGzip] {
        let name = format!("{:?}", encoding);
        let encoded = codec::encode(&report, encoding).expect("encode");
        group.bench_function(BenchmarkId::new("encode", &name), |bench| {
            bench.iter(|| codec::encode(bb(&report), encoding).expect("encode"));
        });
        group.bench_function(BenchmarkId::new("decode", &name), |bench| {
            bench.iter(|| codec::decode(bb(&encoded), encoding).expect("decode"));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_merge, bench_window_fold, bench_codec);
criterion_main!(benches);

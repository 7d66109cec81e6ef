/// Sampling and aggregation cost
///
/// A locality sample parses the whole numa_maps of the target on every tick,
/// so its cost grows with the number of mappings. These benchmarks track that
/// cost, phase matching on output lines, and merging of per-process logs.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use numa_emu::aggregate::{Aggregator, RunStream};
use numa_emu::cli::OutputFormat;
use numa_emu::glob::GlobPattern;
use numa_emu::stats::NodePages;
use std::io::Cursor;

/// numa_maps text with `mappings` lines spread over both nodes
fn synthetic_numa_maps(mappings: usize) -> String {
    (0..mappings)
        .map(|i| {
            format!(
                "7f{:08x}000 default anon={} dirty={} active=0 N0={} N1={} kernelpagesize_kB=4\n",
                i,
                i % 512 + 1,
                i % 512 + 1,
                i % 300,
                i % 212 + 1
            )
        })
        .collect()
}

fn synthetic_log(offset: f64, samples: usize) -> Vec<u8> {
    let mut text = format!("emu: sync {}\n", offset);
    for t in 0..samples {
        text.push_str(&format!(
            "emu: local% {:.2} localGB 1.00 remoteGB 3.00 totalGB 4.00 time {:.2}\n",
            25.0 + (t % 10) as f64,
            t as f64 + offset
        ));
    }
    text.into_bytes()
}

fn bench_numa_maps_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("numa_maps_parse");

    for mappings in [64, 512, 4096] {
        let text = synthetic_numa_maps(mappings);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(mappings), &text, |b, text| {
            b.iter(|| {
                let pages = NodePages::parse(black_box(text)).unwrap();
                black_box(pages.to_sample(4096, 0.0));
            });
        });
    }

    group.finish();
}

fn bench_phase_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("phase_matching");
    let pattern = GlobPattern::new("*iteration ? done*");
    let hit = "solver: iteration 7 done, residual 1e-9";
    let miss = "solver: assembling matrix block 7 of 9 with 1048576 rows";

    group.bench_function("match", |b| b.iter(|| pattern.matches(black_box(hit))));
    group.bench_function("no_match", |b| b.iter(|| pattern.matches(black_box(miss))));

    group.finish();
}

fn bench_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate");

    for streams in [2, 8, 32] {
        let logs: Vec<Vec<u8>> = (0..streams)
            .map(|i| synthetic_log(i as f64 * 0.05, 600))
            .collect();
        group.throughput(Throughput::Elements((streams * 600) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(streams), &logs, |b, logs| {
            b.iter(|| {
                let streams = logs
                    .iter()
                    .map(|log| RunStream::open("bench", Cursor::new(log.as_slice())).unwrap())
                    .collect();
                let mut out = Vec::new();
                let windows = Aggregator::new(streams)
                    .run(&mut out, OutputFormat::Text)
                    .unwrap();
                black_box(windows);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_numa_maps_parse,
    bench_phase_matching,
    bench_aggregate
);
criterion_main!(benches);

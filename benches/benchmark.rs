use std::io;
use std::path::PathBuf;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use hvac_audit::pipeline::shared::SharedPipeline;
use hvac_audit::{AnalysisConfig, PartitionedScan, ReportSink};

fn benchmark(c: &mut Criterion) {
    let path = PathBuf::from(std::env::var("HVAC_LOG_FILE").expect("No file specified"));
    let config = AnalysisConfig::default();

    let mut group = c.benchmark_group("Log Analysis");
    group.sample_size(10);
    group.warm_up_time(Duration::from_secs(5));
    group.measurement_time(Duration::from_secs(60));
    group.bench_function("partitioned_scan", |b| {
        b.iter(|| PartitionedScan::new(config).run(&path, &ReportSink::new(io::sink())).unwrap())
    });
    group.bench_function("shared_pipeline", |b| {
        b.iter(|| SharedPipeline::new(config).run(&path, &ReportSink::new(io::sink())).unwrap())
    });

    group.finish();
}

criterion_group!(benches, benchmark);
criterion_main!(benches);

use std::io::{self, Write};
use std::path::Path;

use crossbeam::queue::SegQueue;
use rayon::prelude::*;
use rayon::{Scope, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::aggregate::BucketAggregator;
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};
use crate::partition::{partition, scan_segment};
use crate::reading::parse_line;
use crate::report::{ReportSink, SinkSummary};
use crate::window::WindowEvaluator;
use crate::{input_size, RecordCounts};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub workers: usize,
    pub counts: RecordCounts,
    pub buckets: usize,
    pub report: SinkSummary,
}

/// Whole-file analysis: N workers each scan one byte range of the log into a shared bucket map,
/// then every month is evaluated once the scan is complete.
///
/// Workers race each other, so "last admitted reading" for a bucket follows whichever worker
/// got there first rather than file order.
pub struct PartitionedScan {
    config: AnalysisConfig,
}

impl PartitionedScan {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn run<W: Write + Send>(&self, path: &Path, sink: &ReportSink<W>) -> Result<ScanSummary> {
        let size = input_size(path)?;
        let segments = partition(size, self.config.workers);
        let workers = segments.len();

        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("scan-{index}"))
            .build()
            .map_err(|error| AnalysisError::launch("scan worker pool", io::Error::other(error)))?;

        info!(path = %path.display(), bytes = size, workers, "starting partitioned scan");
        let aggregator = BucketAggregator::new(self.config.filter());
        let results = SegQueue::new();
        pool.scope(|s: &Scope| {
            for (index, segment) in segments.into_iter().enumerate() {
                let (aggregator, results) = (&aggregator, &results);
                s.spawn(move |_| {
                    let mut counts = RecordCounts::default();
                    let scanned = scan_segment(path, segment, |line| match parse_line(line) {
                        Some(reading) => counts.count(aggregator.admit(&reading)),
                        None => counts.invalid += 1,
                    });
                    let outcome = scanned.map(|lines| {
                        counts.lines = lines;
                        counts
                    });
                    debug!(worker = index, start = segment.start, end = segment.end, ?outcome, "segment scanned");
                    results.push(outcome);
                });
            }
        });

        let mut counts = RecordCounts::default();
        for outcome in results {
            let worker_counts = outcome.map_err(|source| AnalysisError::io(path, source))?;
            counts.union(&worker_counts);
        }

        let buckets = aggregator.len();
        let windows = aggregator.into_windows();
        let evaluator = WindowEvaluator::new(self.config.season);
        pool.install(|| {
            windows
                .par_iter()
                .try_for_each(|window| sink.record(&evaluator.evaluate(window)))
        })
        .map_err(AnalysisError::Report)?;
        let report = sink.finish().map_err(AnalysisError::Report)?;

        info!(%counts, buckets, windows = report.windows, issues = report.issues, "partitioned scan finished");
        Ok(ScanSummary { workers, counts, buckets, report })
    }
}

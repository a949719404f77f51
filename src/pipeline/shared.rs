use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::thread::{self, Scope, ScopedJoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, warn};

use super::{PipelineSummary, Stage, StageState, StageStatus};
use crate::aggregate::{AnomalyFilter, Window, WindowAccumulator};
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};
use crate::reading::{parse_line, Reading};
use crate::report::{ReportSink, SinkSummary};
use crate::window::{SeasonConfig, WindowEvaluator, WindowReport};
use crate::{input_size, RecordCounts};

const READ_BUFFER_SIZE: usize = 1 << 16;

/// Prepares the thread a stage runs on.
type ThreadFactory = fn(Stage) -> io::Result<thread::Builder>;

fn named_thread(stage: Stage) -> io::Result<thread::Builder> {
    Ok(thread::Builder::new().name(stage.to_string()))
}

/// Five stage threads joined by bounded channels. End of stream is the channel disconnecting
/// once the upstream stage drops its sender.
pub struct SharedPipeline {
    config: AnalysisConfig,
    threads: ThreadFactory,
}

struct Aggregated {
    counts: RecordCounts,
    windows: usize,
}

impl SharedPipeline {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config, threads: named_thread }
    }

    #[cfg(test)]
    fn with_threads(mut self, threads: ThreadFactory) -> Self {
        self.threads = threads;
        self
    }

    pub fn run<W: Write + Send>(&self, path: &Path, sink: &ReportSink<W>) -> Result<PipelineSummary> {
        input_size(path)?;
        let file = File::open(path).map_err(|source| AnalysisError::io(path, source))?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.workers.max(2))
            .thread_name(|index| format!("evaluator-{index}"))
            .build()
            .map_err(|error| AnalysisError::launch("evaluation pool", io::Error::other(error)))?;

        let statuses = Stage::ALL.map(StageStatus::new);
        let capacity = self.config.queue_capacity;
        let (line_tx, line_rx) = bounded::<String>(capacity);
        let (reading_tx, reading_rx) = bounded::<Reading>(capacity);
        let (window_tx, window_rx) = bounded::<Window>(capacity);
        let (report_tx, report_rx) = bounded::<WindowReport>(capacity);
        let (filter, season, pool) = (self.config.filter(), self.config.season, &pool);
        let threads = self.threads;

        info!(path = %path.display(), capacity, "starting shared-memory pipeline");
        let outcome = thread::scope(|s| -> Result<_> {
            let [reader_status, parser_status, aggregator_status, evaluator_status, writer_status] = &statuses;
            let reader = launch(s, threads, reader_status, move |status| read_lines(path, file, line_tx, status))?;
            let parser = launch(s, threads, parser_status, move |status| parse_lines(line_rx, reading_tx, status))?;
            let aggregator = launch(s, threads, aggregator_status, move |status| {
                aggregate_readings(reading_rx, window_tx, filter, status)
            })?;
            let evaluator = launch(s, threads, evaluator_status, move |status| {
                evaluate_windows(window_rx, report_tx, season, pool, status)
            })?;
            let writer = launch(s, threads, writer_status, move |status| write_reports(report_rx, sink, status))?;

            // Join everything before surfacing the first failure
            let lines = join(Stage::Reader, reader);
            let parsed = join(Stage::Parser, parser);
            let aggregated = join(Stage::Aggregator, aggregator);
            let evaluated = join(Stage::Evaluator, evaluator);
            let report = join(Stage::Writer, writer);
            Ok((lines?, parsed?, aggregated?, evaluated?, report?))
        });
        let (lines, parsed, aggregated, evaluated, report) = outcome?;
        debug!(windows = aggregated.windows, evaluated, "windows handed off");

        let counts = RecordCounts {
            lines,
            invalid: parsed.invalid,
            admitted: aggregated.counts.admitted,
            rejected: aggregated.counts.rejected,
        };
        info!(%counts, windows = aggregated.windows, issues = report.issues, "shared-memory pipeline finished");
        Ok(PipelineSummary {
            counts,
            windows: aggregated.windows,
            report,
            stages: statuses.iter().map(|status| (status.stage(), status.get())).collect(),
        })
    }
}

fn launch<'scope, 'env, T, F>(
    scope: &'scope Scope<'scope, 'env>,
    threads: ThreadFactory,
    status: &StageStatus,
    body: F,
) -> Result<ScopedJoinHandle<'scope, Result<T>>>
where
    T: Send + 'scope,
    F: FnOnce(&StageStatus) -> Result<T> + Send + 'scope,
{
    let status = status.clone();
    let stage = status.stage();
    threads(stage)
        .and_then(|builder| {
            builder.spawn_scoped(scope, move || {
                status.set(StageState::Running);
                let result = body(&status);
                status.set(StageState::Terminated);
                match &result {
                    Ok(_) => info!(%stage, "stage terminated"),
                    Err(error) => warn!(%stage, %error, "stage terminated with error"),
                }
                result
            })
        })
        .map_err(|source| AnalysisError::launch(format!("{stage} stage"), source))
}

fn join<T>(stage: Stage, handle: ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    handle
        .join()
        .map_err(|_| AnalysisError::stage_failed(stage, "stage thread panicked"))?
}

fn read_lines(path: &Path, file: File, lines: Sender<String>, status: &StageStatus) -> Result<u64> {
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    let mut buffer = Vec::new();
    let mut count = 0;
    loop {
        buffer.clear();
        let read = reader
            .read_until(b'\n', &mut buffer)
            .map_err(|source| AnalysisError::io(path, source))?;
        if read == 0 {
            break;
        }
        count += 1;
        let line = String::from_utf8_lossy(&buffer).trim_end_matches(['\n', '\r']).to_string();
        if lines.send(line).is_err() {
            warn!("parser hung up; reader stopping early");
            break;
        }
    }
    status.set(StageState::Draining);
    info!(lines = count, "reader drained");
    Ok(count)
}

fn parse_lines(lines: Receiver<String>, readings: Sender<Reading>, status: &StageStatus) -> Result<RecordCounts> {
    let mut counts = RecordCounts::default();
    for line in lines.iter() {
        counts.lines += 1;
        match parse_line(&line) {
            Some(reading) => {
                if readings.send(reading).is_err() {
                    break;
                }
            }
            None => counts.invalid += 1,
        }
    }
    status.set(StageState::Draining);
    info!(lines = counts.lines, invalid = counts.invalid, "parser drained");
    Ok(counts)
}

fn aggregate_readings(
    readings: Receiver<Reading>,
    windows: Sender<Window>,
    filter: AnomalyFilter,
    status: &StageStatus,
) -> Result<Aggregated> {
    let mut accumulator = WindowAccumulator::new(filter);
    let mut aggregated = Aggregated { counts: RecordCounts::default(), windows: 0 };
    let mut downstream_open = true;
    for reading in readings.iter() {
        let (admission, closed) = accumulator.push(&reading);
        aggregated.counts.count(admission);
        if let Some(window) = closed {
            aggregated.windows += 1;
            if windows.send(window).is_err() {
                downstream_open = false;
                break;
            }
        }
    }
    status.set(StageState::Draining);
    if let Some(window) = accumulator.finish().filter(|_| downstream_open) {
        aggregated.windows += 1;
        let _ = windows.send(window);
    }
    info!(admitted = aggregated.counts.admitted, rejected = aggregated.counts.rejected, "aggregator drained");
    Ok(aggregated)
}

/// Each closed window gets its own evaluation task; reports reach the writer in completion order.
fn evaluate_windows(
    windows: Receiver<Window>,
    reports: Sender<WindowReport>,
    season: SeasonConfig,
    pool: &ThreadPool,
    status: &StageStatus,
) -> Result<usize> {
    let evaluator = WindowEvaluator::new(season);
    let mut evaluated = 0;
    pool.scope(|s| {
        for window in windows.iter() {
            evaluated += 1;
            let reports = reports.clone();
            s.spawn(move |_| {
                let _ = reports.send(evaluator.evaluate(&window));
            });
        }
        status.set(StageState::Draining);
    });
    Ok(evaluated)
}

fn write_reports<W: Write>(reports: Receiver<WindowReport>, sink: &ReportSink<W>, status: &StageStatus) -> Result<SinkSummary> {
    for report in reports.iter() {
        sink.record(&report).map_err(AnalysisError::Report)?;
    }
    status.set(StageState::Draining);
    sink.finish().map_err(AnalysisError::Report)
}

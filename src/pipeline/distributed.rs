use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};

use tracing::{info, warn};

use super::envelope::{EnvelopeReader, EnvelopeWriter, Payload};
use super::{Stage, StageState, StageStatus};
use crate::aggregate::{AnomalyFilter, WindowAccumulator};
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};
use crate::reading::parse_line;
use crate::report::{ReportSink, SinkSummary};
use crate::window::{SeasonConfig, WindowEvaluator};
use crate::{input_size, RecordCounts};

/// Everything a stage process is started with.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub config: AnalysisConfig,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

/// Runs one stage inside the current process, reading envelopes from stdin and writing them to
/// stdout. The reader takes its lines from `input` and the writer its report target from
/// `output`; both are opened before the stage counts as running.
pub fn run_stage(stage: Stage, context: &StageContext) -> Result<()> {
    let status = StageStatus::new(stage);
    let batch_size = context.config.batch_size;
    match stage {
        Stage::Reader => {
            let path = required(stage, "--input", context.input.as_deref())?;
            let file = File::open(path).map_err(|source| AnalysisError::io(path, source))?;
            supervise(&status, |status| reader_stage(BufReader::new(file), batch_size, io::stdout().lock(), status))?;
        }
        Stage::Parser => {
            supervise(&status, |status| parser_stage(io::stdin().lock(), batch_size, io::stdout().lock(), status))?;
        }
        Stage::Aggregator => {
            let filter = context.config.filter();
            supervise(&status, |status| aggregator_stage(io::stdin().lock(), filter, io::stdout().lock(), status))?;
        }
        Stage::Evaluator => {
            let season = context.config.season;
            supervise(&status, |status| evaluator_stage(io::stdin().lock(), season, io::stdout().lock(), status))?;
        }
        Stage::Writer => {
            let path = required(stage, "--output", context.output.as_deref())?;
            let file = File::create(path).map_err(|source| AnalysisError::io(path, source))?;
            let sink = ReportSink::new(file);
            supervise(&status, |status| writer_stage(io::stdin().lock(), &sink, status))?;
            sink.into_inner().map_err(AnalysisError::Report)?;
        }
    }
    Ok(())
}

fn required<'a>(stage: Stage, flag: &str, path: Option<&'a Path>) -> Result<&'a Path> {
    path.ok_or_else(|| AnalysisError::Config(format!("{stage} stage needs {flag}")))
}

fn supervise<T>(status: &StageStatus, body: impl FnOnce(&StageStatus) -> Result<T>) -> Result<T> {
    let stage = status.stage();
    status.set(StageState::Running);
    let result = body(status);
    status.set(StageState::Terminated);
    match &result {
        Ok(_) => info!(%stage, "stage terminated"),
        Err(error) => warn!(%stage, %error, "stage terminated with error"),
    }
    result
}

fn unexpected(upstream: Stage, payload: &Payload) -> AnalysisError {
    AnalysisError::protocol(upstream, format!("unexpected {} payload", payload.kind()))
}

pub fn reader_stage<R: BufRead, W: Write>(mut input: R, batch_size: usize, output: W, status: &StageStatus) -> Result<u64> {
    let mut out = EnvelopeWriter::new(Stage::Reader, output);
    let mut buffer = Vec::new();
    let mut batch = Vec::with_capacity(batch_size);
    let mut lines = 0;
    loop {
        buffer.clear();
        let read = input
            .read_until(b'\n', &mut buffer)
            .map_err(|error| AnalysisError::stage_failed(Stage::Reader, format!("cannot read input: {error}")))?;
        if read == 0 {
            break;
        }
        lines += 1;
        batch.push(String::from_utf8_lossy(&buffer).trim_end_matches(['\n', '\r']).to_string());
        if batch.len() >= batch_size {
            out.send(Payload::Lines(mem::take(&mut batch)))?;
        }
    }
    status.set(StageState::Draining);
    if !batch.is_empty() {
        out.send(Payload::Lines(batch))?;
    }
    out.close()?;
    info!(lines, "reader drained");
    Ok(lines)
}

/// Returns the lines seen and how many of them were invalid.
pub fn parser_stage<R: BufRead, W: Write>(input: R, batch_size: usize, output: W, status: &StageStatus) -> Result<RecordCounts> {
    let mut upstream = EnvelopeReader::new(Stage::Reader, input);
    let mut out = EnvelopeWriter::new(Stage::Parser, output);
    let mut counts = RecordCounts::default();
    let mut batch = Vec::with_capacity(batch_size);
    while let Some(payload) = upstream.recv()? {
        let lines = match payload {
            Payload::Lines(lines) => lines,
            other => return Err(unexpected(Stage::Reader, &other)),
        };
        for line in lines {
            counts.lines += 1;
            match parse_line(&line) {
                Some(reading) => batch.push(reading),
                None => counts.invalid += 1,
            }
            if batch.len() >= batch_size {
                out.send(Payload::Readings(mem::take(&mut batch)))?;
            }
        }
    }
    status.set(StageState::Draining);
    if !batch.is_empty() {
        out.send(Payload::Readings(batch))?;
    }
    out.close()?;
    info!(lines = counts.lines, invalid = counts.invalid, "parser drained");
    Ok(counts)
}

/// Returns admission counts and the number of windows closed.
pub fn aggregator_stage<R: BufRead, W: Write>(
    input: R,
    filter: AnomalyFilter,
    output: W,
    status: &StageStatus,
) -> Result<(RecordCounts, usize)> {
    let mut upstream = EnvelopeReader::new(Stage::Parser, input);
    let mut out = EnvelopeWriter::new(Stage::Aggregator, output);
    let mut accumulator = WindowAccumulator::new(filter);
    let mut counts = RecordCounts::default();
    let mut windows = 0;
    while let Some(payload) = upstream.recv()? {
        let readings = match payload {
            Payload::Readings(readings) => readings,
            other => return Err(unexpected(Stage::Parser, &other)),
        };
        for reading in &readings {
            let (admission, closed) = accumulator.push(reading);
            counts.count(admission);
            if let Some(window) = closed {
                windows += 1;
                out.send(Payload::Window(window))?;
            }
        }
    }
    status.set(StageState::Draining);
    if let Some(window) = accumulator.finish() {
        windows += 1;
        out.send(Payload::Window(window))?;
    }
    out.close()?;
    info!(admitted = counts.admitted, rejected = counts.rejected, windows, "aggregator drained");
    Ok((counts, windows))
}

pub fn evaluator_stage<R: BufRead, W: Write>(
    input: R,
    season: SeasonConfig,
    output: W,
    status: &StageStatus,
) -> Result<usize> {
    let mut upstream = EnvelopeReader::new(Stage::Aggregator, input);
    let mut out = EnvelopeWriter::new(Stage::Evaluator, output);
    let evaluator = WindowEvaluator::new(season);
    let mut evaluated = 0;
    while let Some(payload) = upstream.recv()? {
        let window = match payload {
            Payload::Window(window) => window,
            other => return Err(unexpected(Stage::Aggregator, &other)),
        };
        evaluated += 1;
        out.send(Payload::Report(evaluator.evaluate(&window)))?;
    }
    status.set(StageState::Draining);
    out.close()?;
    Ok(evaluated)
}

pub fn writer_stage<R: BufRead, W: Write>(input: R, sink: &ReportSink<W>, status: &StageStatus) -> Result<SinkSummary> {
    let mut upstream = EnvelopeReader::new(Stage::Evaluator, input);
    while let Some(payload) = upstream.recv()? {
        let report = match payload {
            Payload::Report(report) => report,
            other => return Err(unexpected(Stage::Evaluator, &other)),
        };
        sink.record(&report).map_err(AnalysisError::Report)?;
    }
    status.set(StageState::Draining);
    let summary = sink.finish().map_err(AnalysisError::Report)?;
    info!(windows = summary.windows, issues = summary.issues, "writer drained");
    Ok(summary)
}

#[derive(Debug, Clone)]
pub struct StageExit {
    pub stage: Stage,
    pub pid: u32,
    pub status: ExitStatus,
}

/// Starts the process for one stage from its fully wired command.
type Spawner = fn(Stage, &mut Command) -> io::Result<Child>;

fn spawn_command(_: Stage, command: &mut Command) -> io::Result<Child> {
    command.spawn()
}

/// One OS process per stage, each a `stage --role <name>` invocation of `program`, with every
/// stage's stdout piped into the next stage's stdin.
pub struct ProcessPipeline {
    program: PathBuf,
    config: AnalysisConfig,
    spawner: Spawner,
}

impl ProcessPipeline {
    pub fn new(program: impl Into<PathBuf>, config: AnalysisConfig) -> Self {
        Self { program: program.into(), config, spawner: spawn_command }
    }

    #[cfg(test)]
    fn with_spawner(mut self, spawner: Spawner) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn run(&self, input: &Path, output: &Path) -> Result<Vec<StageExit>> {
        input_size(input)?;
        File::create(output).map_err(|source| AnalysisError::io(output, source))?;
        let config = serde_json::to_string(&self.config).map_err(|error| AnalysisError::Config(error.to_string()))?;

        let mut children: Vec<(Stage, Child)> = Vec::with_capacity(Stage::ALL.len());
        let mut upstream: Option<ChildStdout> = None;
        for stage in Stage::ALL {
            let mut command = Command::new(&self.program);
            command
                .args(["stage", "--role", stage.name(), "--config", config.as_str()])
                .stdin(upstream.take().map_or_else(Stdio::null, Stdio::from))
                .stdout(if stage == Stage::Writer { Stdio::null() } else { Stdio::piped() })
                .stderr(Stdio::inherit());
            match stage {
                Stage::Reader => command.arg("--input").arg(input),
                Stage::Writer => command.arg("--output").arg(output),
                _ => &mut command,
            };

            match (self.spawner)(stage, &mut command) {
                Ok(mut child) => {
                    info!(%stage, pid = child.id(), "stage process launched");
                    upstream = child.stdout.take();
                    children.push((stage, child));
                }
                Err(source) => {
                    abort(children);
                    return Err(AnalysisError::launch(format!("{stage} stage process"), source));
                }
            }
        }

        let exits = reap(children, Child::wait)?;

        let failed: Vec<&StageExit> = exits.iter().filter(|exit| !exit.status.success()).collect();
        for exit in &failed {
            warn!(stage = %exit.stage, status = %exit.status, "stage process failed");
        }
        match failed.first() {
            Some(exit) => Err(AnalysisError::stage_failed(exit.stage, format!("process exited with {}", exit.status))),
            None => Ok(exits),
        }
    }
}

/// Waits for every stage process, even after one wait fails, and returns their exits in stage
/// order. A failed wait is reported only once all the others have been collected.
fn reap(
    children: Vec<(Stage, Child)>,
    mut wait: impl FnMut(&mut Child) -> io::Result<ExitStatus>,
) -> Result<Vec<StageExit>> {
    let mut exits = Vec::with_capacity(children.len());
    let mut wait_failure = None;
    for (stage, mut child) in children {
        let pid = child.id();
        match wait(&mut child) {
            Ok(status) => {
                info!(%stage, pid, %status, "stage process exited");
                exits.push(StageExit { stage, pid, status });
            }
            Err(error) => {
                warn!(%stage, pid, %error, "cannot wait for stage process");
                if let Err(error) = child.kill().and_then(|_| child.wait()) {
                    warn!(%stage, pid, %error, "cannot reap stage process");
                }
                wait_failure.get_or_insert_with(|| {
                    AnalysisError::stage_failed(stage, format!("cannot wait for process {pid}: {error}"))
                });
            }
        }
    }
    match wait_failure {
        Some(error) => Err(error),
        None => Ok(exits),
    }
}

/// Kills and reaps stage processes that were started before a launch failure.
fn abort(children: Vec<(Stage, Child)>) {
    for (stage, mut child) in children {
        let pid = child.id();
        if let Err(error) = child.kill() {
            warn!(%stage, pid, %error, "cannot kill stage process");
        }
        match child.wait() {
            Ok(status) => info!(%stage, pid, %status, "stage process reaped"),
            Err(error) => warn!(%stage, pid, %error, "cannot reap stage process"),
        }
    }
}

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hvac_audit::aggregate::DEFAULT_ANOMALY_THRESHOLD;
use hvac_audit::config::{DEFAULT_BATCH_SIZE, DEFAULT_COOLING_MONTHS, DEFAULT_HEATING_MONTHS, DEFAULT_QUEUE_CAPACITY};
use hvac_audit::pipeline::distributed::{run_stage, ProcessPipeline, StageContext};
use hvac_audit::pipeline::shared::SharedPipeline;
use hvac_audit::pipeline::Stage;
use hvac_audit::{AnalysisConfig, PartitionedScan, ReportSink};

#[derive(Parser)]
#[command(name = "hvac-audit", version, about = "Find heating and cooling faults in HVAC temperature logs")]
struct Cli {
    #[command(flatten)]
    analysis: AnalysisArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct AnalysisArgs {
    /// Months audited for heating faults
    #[arg(long, global = true, env = "HVAC_HEATING", value_delimiter = ',', default_values_t = DEFAULT_HEATING_MONTHS)]
    heating: Vec<u8>,

    /// Months audited for cooling faults
    #[arg(long, global = true, env = "HVAC_COOLING", value_delimiter = ',', default_values_t = DEFAULT_COOLING_MONTHS)]
    cooling: Vec<u8>,

    /// Largest admitted jump between consecutive readings of one hour
    #[arg(long, global = true, env = "HVAC_THRESHOLD", default_value_t = DEFAULT_ANOMALY_THRESHOLD)]
    threshold: f64,

    /// Scan workers (defaults to the number of CPUs)
    #[arg(long, global = true, env = "HVAC_WORKERS")]
    workers: Option<usize>,

    #[arg(long, global = true, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Records per message between stage processes
    #[arg(long, global = true, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

impl AnalysisArgs {
    fn config(&self) -> Result<AnalysisConfig> {
        let mut config = AnalysisConfig::new(&self.heating, &self.cooling, self.threshold)?
            .with_queue_capacity(self.queue_capacity)
            .with_batch_size(self.batch_size);
        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Split the log into byte ranges and scan them in parallel
    Scan {
        #[arg(short, long)]
        input: PathBuf,
        /// Report file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the five analysis stages as threads joined by bounded queues
    Pipeline {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the five analysis stages as separate processes
    Distributed {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Run a single stage of the distributed pipeline over stdin/stdout
    #[command(hide = true)]
    Stage {
        #[arg(long)]
        role: Stage,
        /// Run configuration as JSON
        #[arg(long)]
        config: String,
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn open_sink(output: Option<&Path>) -> Result<ReportSink<Box<dyn Write + Send>>> {
    let writer: Box<dyn Write + Send> = match output {
        Some(path) => Box::new(File::create(path).with_context(|| format!("cannot create {}", path.display()))?),
        None => Box::new(io::stdout()),
    };
    Ok(ReportSink::new(writer))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();
    let config = cli.analysis.config().context("invalid analysis settings")?;

    match cli.command {
        Command::Scan { input, output } => {
            let sink = open_sink(output.as_deref())?;
            let summary = PartitionedScan::new(config)
                .run(&input, &sink)
                .with_context(|| format!("scan of {} failed", input.display()))?;
            sink.into_inner().context("cannot finish report")?;
            info!(counts = %summary.counts, buckets = summary.buckets, issues = summary.report.issues, "scan complete");
        }
        Command::Pipeline { input, output } => {
            let sink = open_sink(output.as_deref())?;
            let summary = SharedPipeline::new(config)
                .run(&input, &sink)
                .with_context(|| format!("pipeline over {} failed", input.display()))?;
            sink.into_inner().context("cannot finish report")?;
            info!(counts = %summary.counts, windows = summary.windows, issues = summary.report.issues, "pipeline complete");
        }
        Command::Distributed { input, output } => {
            let program = std::env::current_exe().context("cannot locate own executable")?;
            let exits = ProcessPipeline::new(program, config)
                .run(&input, &output)
                .with_context(|| format!("distributed pipeline over {} failed", input.display()))?;
            info!(stages = exits.len(), report = %output.display(), "distributed pipeline complete");
        }
        Command::Stage { role, config, input, output } => {
            let config: AnalysisConfig = serde_json::from_str(&config).context("invalid stage configuration")?;
            run_stage(role, &StageContext { config, input, output }).with_context(|| format!("{role} stage failed"))?;
            return Ok(());
        }
    }

    info!(elapsed = ?start.elapsed(), "total");
    Ok(())
}

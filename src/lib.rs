#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::fmt::{self, Display};
use std::fs;
use std::path::Path;

pub mod aggregate;
pub mod config;
pub mod error;
pub mod partition;
pub mod pipeline;
pub mod reading;
pub mod report;
pub mod scan;
pub mod window;

pub use aggregate::{Admission, AnomalyFilter, BucketAggregator, HourlyAccumulator, Window, WindowAccumulator};
pub use config::AnalysisConfig;
pub use error::{AnalysisError, Result};
pub use reading::{parse_line, MonthKey, Reading, TimeKey};
pub use report::{ReportSink, SinkSummary};
pub use scan::{PartitionedScan, ScanSummary};
pub use window::{Classification, Issue, MonthlyStatistics, SeasonConfig, WindowEvaluator, WindowReport};

/// What happened to the records of one run. `lines = invalid + admitted + rejected`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub lines: u64,
    pub invalid: u64,
    pub admitted: u64,
    pub rejected: u64,
}
impl Display for RecordCounts {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} lines / {} invalid / {} admitted / {} rejected",
            self.lines,
            self.invalid,
            self.admitted,
            self.rejected,
        )
    }
}
impl RecordCounts {
    pub fn count(&mut self, admission: Admission) {
        match admission {
            Admission::Admitted => self.admitted += 1,
            Admission::Rejected => self.rejected += 1,
        }
    }
    pub fn union(&mut self, other: &RecordCounts) {
        self.lines += other.lines;
        self.invalid += other.invalid;
        self.admitted += other.admitted;
        self.rejected += other.rejected;
    }
}

/// Size of the input in bytes. A missing or empty source is fatal before any worker starts.
pub(crate) fn input_size(path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path).map_err(|source| AnalysisError::io(path, source))?;
    if metadata.len() == 0 {
        return Err(AnalysisError::EmptyInput(path.to_path_buf()));
    }
    Ok(metadata.len())
}

use std::fmt::{self, Display};
use std::io::{self, BufWriter, Write};
use std::sync::{Mutex, PoisonError};

use crate::window::{Issue, MonthSet, WindowReport};

const WRITER_CAPACITY: usize = 1 << 16;

impl Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} issue detected: {}/{}/{} At Hour: {} | Temp: {:.2} | Mean: {:.2} | Stddev: {:.2}",
            self.classification,
            self.time_key.month,
            self.time_key.day,
            self.time_key.year,
            self.time_key.hour,
            self.temperature,
            self.mean,
            self.std_dev,
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkSummary {
    pub windows: usize,
    pub issues: usize,
    pub months_without_data: Vec<u8>,
}

struct SinkState<W: Write> {
    writer: BufWriter<W>,
    months_with_data: MonthSet,
    summary: SinkSummary,
    finished: bool,
}

/// Line-oriented issue report. Any number of workers may record into it; each window's issues
/// are written in one critical section, in whatever order the windows arrive.
pub struct ReportSink<W: Write> {
    state: Mutex<SinkState<W>>,
}

impl<W: Write> ReportSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            state: Mutex::new(SinkState {
                writer: BufWriter::with_capacity(WRITER_CAPACITY, writer),
                months_with_data: MonthSet::default(),
                summary: SinkSummary::default(),
                finished: false,
            }),
        }
    }

    /// Writes the window's statistics line followed by its issues.
    pub fn record(&self, report: &WindowReport) -> io::Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if report.stats.sample_count > 0 {
            writeln!(state.writer, "Month: {} | Mean Temperature: {:.2} | Standard Deviation: {:.2}",
                report.key.month,
                report.stats.mean,
                report.stats.std_dev,
            )?;
        }
        for issue in &report.issues {
            writeln!(state.writer, "{issue}")?;
        }
        state.summary.windows += 1;
        state.summary.issues += report.issues.len();
        if report.stats.sample_count > 0 {
            state.months_with_data.insert(report.key.month);
        }
        Ok(())
    }

    /// Reports every calendar month that never received data, then flushes.
    pub fn finish(&self) -> io::Result<SinkSummary> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.finished {
            let missing: Vec<u8> = (1..=12).filter(|&month| !state.months_with_data.contains(month)).collect();
            for &month in &missing {
                writeln!(state.writer, "Month: {month} - No data available")?;
            }
            state.summary.months_without_data = missing;
            state.finished = true;
        }
        state.writer.flush()?;
        Ok(state.summary.clone())
    }

    pub fn into_inner(self) -> io::Result<W> {
        let state = self.state.into_inner().unwrap_or_else(PoisonError::into_inner);
        state.writer.into_inner().map_err(|error| error.into_error())
    }
}

#[cfg(test)]
mod tests {

    use super::ReportSink;
    use crate::reading::{MonthKey, TimeKey};
    use crate::window::{Classification, Issue, MonthlyStatistics, WindowReport};

    fn report(month: u8, issues: Vec<Issue>) -> WindowReport {
        WindowReport {
            key: MonthKey { year: 2024, month },
            stats: MonthlyStatistics { mean: 70.0, std_dev: 1.5, sample_count: 10 },
            issues,
        }
    }

    #[test]
    fn test_issue_line_format() {
        let issue = Issue {
            time_key: TimeKey { year: 2024, month: 7, day: 4, hour: 14 },
            temperature: 85.3,
            mean: 80.126,
            std_dev: 2.0,
            classification: Classification::Cooling,
        };
        assert_eq!(
            issue.to_string(),
            "Cooling issue detected: 7/4/2024 At Hour: 14 | Temp: 85.30 | Mean: 80.13 | Stddev: 2.00"
        );
    }

    #[test]
    fn test_no_data_months() {
        let sink = ReportSink::new(Vec::new());
        let issue = Issue {
            time_key: TimeKey { year: 2024, month: 1, day: 2, hour: 3 },
            temperature: 60.0,
            mean: 70.0,
            std_dev: 1.5,
            classification: Classification::Heating,
        };
        sink.record(&report(1, vec![issue])).unwrap();
        sink.record(&report(2, Vec::new())).unwrap();
        sink.record(&report(8, Vec::new())).unwrap();

        let summary = sink.finish().unwrap();
        assert_eq!(summary.windows, 3);
        assert_eq!(summary.issues, 1);
        // Months outside both seasons are reported too
        assert_eq!(summary.months_without_data, vec![3, 4, 5, 6, 7, 9, 10, 11, 12]);
        // Finishing twice must not repeat the trailer
        sink.finish().unwrap();

        let output = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 4 + 9);
        assert_eq!(lines[0], "Month: 1 | Mean Temperature: 70.00 | Standard Deviation: 1.50");
        assert!(lines[1].starts_with("Heating issue detected: 1/2/2024 At Hour: 3"));
        assert_eq!(lines[2], "Month: 2 | Mean Temperature: 70.00 | Standard Deviation: 1.50");
        assert_eq!(lines[3], "Month: 8 | Mean Temperature: 70.00 | Standard Deviation: 1.50");
        assert_eq!(lines[4], "Month: 3 - No data available");
        assert_eq!(lines[6], "Month: 5 - No data available");
        assert_eq!(lines[12], "Month: 12 - No data available");
    }

    #[test]
    fn test_empty_window_has_no_statistics_line() {
        let sink = ReportSink::new(Vec::new());
        let mut empty = report(5, Vec::new());
        empty.stats = MonthlyStatistics::default();
        sink.record(&empty).unwrap();

        let summary = sink.finish().unwrap();
        assert_eq!(summary.windows, 1);
        assert_eq!(summary.months_without_data, (1..=12).collect::<Vec<u8>>());
        let output = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert!(!output.contains("Mean Temperature"));
        assert!(output.contains("Month: 5 - No data available"));
    }
}

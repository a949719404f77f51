use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;

use hvac_audit::pipeline::distributed::ProcessPipeline;
use hvac_audit::pipeline::Stage;
use hvac_audit::{AnalysisConfig, AnalysisError, PartitionedScan, ReportSink};

const BINARY: &str = env!("CARGO_BIN_EXE_hvac-audit");

fn write_log(path: &Path) {
    let mut file = fs::File::create(path).unwrap();
    for (month, odd_hour, odd_temperature) in [(2, 5, 50.0), (7, 14, 88.0)] {
        for day in 1..=7 {
            for hour in 0..24 {
                let base = if hour == odd_hour { odd_temperature } else { 69.0 };
                writeln!(file, "{month}/{day}/2023 {hour}:05:00 {base:.1}").unwrap();
                writeln!(file, "{month}/{day}/2023 {hour}:35:00 {:.1}", base + 0.4).unwrap();
                writeln!(file, "{month}/{day}/2023 {hour}:50:00 {:.1}", base + 12.0).unwrap();
            }
        }
        writeln!(file, "#### sensor offline ####").unwrap();
    }
}

fn sorted_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = text.lines().map(String::from).collect();
    lines.sort();
    lines
}

#[test]
fn distributed_pipeline_matches_scan() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("hvac.log");
    let output = dir.path().join("report.txt");
    write_log(&input);

    let exits = ProcessPipeline::new(BINARY, AnalysisConfig::default().with_batch_size(7))
        .run(&input, &output)
        .unwrap();
    assert_eq!(exits.iter().map(|exit| exit.stage).collect::<Vec<_>>(), Stage::ALL.to_vec());
    assert!(exits.iter().all(|exit| exit.status.success()));

    // A single scan worker sees every hour in file order, like the staged pipelines
    let sink = ReportSink::new(Vec::new());
    let summary = PartitionedScan::new(AnalysisConfig::default().with_workers(1)).run(&input, &sink).unwrap();
    assert_eq!(summary.counts.invalid, 2);
    assert_eq!(summary.counts.rejected, 2 * 7 * 24);

    let scanned = String::from_utf8(sink.into_inner().unwrap()).unwrap();
    let distributed = fs::read_to_string(&output).unwrap();
    assert_eq!(sorted_lines(&distributed), sorted_lines(&scanned));
    assert_eq!(distributed.lines().filter(|l| l.starts_with("Heating issue detected: 2/")).count(), 7);
    assert_eq!(distributed.lines().filter(|l| l.starts_with("Cooling issue detected: 7/")).count(), 7);
    assert!(distributed.contains("Month: 12 - No data available"));
}

#[test]
fn scan_worker_count_only_moves_readings_between_admitted_and_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("hvac.log");
    write_log(&input);

    // Segment boundaries can hand a spike to a worker before the readings it follows, so
    // admissions vary with the worker count; the line accounting never does.
    for workers in [1, 2, 7, 8, 16, 24, 32] {
        let sink = ReportSink::new(Vec::new());
        let summary = PartitionedScan::new(AnalysisConfig::default().with_workers(workers)).run(&input, &sink).unwrap();
        let counts = summary.counts;
        assert_eq!(counts.lines, 2 * 7 * 24 * 3 + 2, "workers={workers}");
        assert_eq!(counts.invalid, 2, "workers={workers}");
        assert_eq!(counts.admitted + counts.rejected, 2 * 7 * 24 * 3, "workers={workers}");
        assert_eq!(summary.buckets, 2 * 7 * 24, "workers={workers}");
        assert_eq!(summary.report.windows, 2, "workers={workers}");
    }
}

#[test]
fn cli_runs_every_mode() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("hvac.log");
    write_log(&input);

    let mut reports = Vec::new();
    for mode in ["scan", "pipeline", "distributed"] {
        let output = dir.path().join(format!("{mode}.txt"));
        let status = Command::new(BINARY)
            .env("RUST_LOG", "warn")
            .args(["--workers", "1", mode, "--input"])
            .arg(&input)
            .arg("--output")
            .arg(&output)
            .status()
            .unwrap();
        assert!(status.success(), "{mode} exited with {status}");
        reports.push(sorted_lines(&fs::read_to_string(&output).unwrap()));
    }
    assert_eq!(reports[0], reports[1]);
    assert_eq!(reports[1], reports[2]);
}

#[test]
fn cli_honours_month_settings() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("hvac.log");
    let output = dir.path().join("report.txt");
    write_log(&input);

    let status = Command::new(BINARY)
        .env("RUST_LOG", "warn")
        .env("HVAC_HEATING", "2")
        .args(["--cooling", "6", "--workers", "1", "scan", "--input"])
        .arg(&input)
        .arg("--output")
        .arg(&output)
        .status()
        .unwrap();
    assert!(status.success());

    let report = fs::read_to_string(&output).unwrap();
    assert_eq!(report.lines().filter(|l| l.contains("issue detected")).count(), 7);
    assert!(report.contains("Month: 6 - No data available"));
    assert!(!report.contains("Cooling issue"));
}

#[test]
fn missing_input_fails_before_launch() {
    let dir = tempfile::tempdir().unwrap();
    let result = ProcessPipeline::new(BINARY, AnalysisConfig::default())
        .run(&dir.path().join("absent.log"), &dir.path().join("report.txt"));
    assert!(matches!(result, Err(AnalysisError::Io { .. })));

    let status = Command::new(BINARY)
        .env("RUST_LOG", "off")
        .args(["distributed", "--input", "absent.log", "--output"])
        .arg(dir.path().join("report.txt"))
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn unwritable_output_fails_before_launch() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("hvac.log");
    write_log(&input);
    let output = dir.path().join("missing").join("report.txt");

    let result = ProcessPipeline::new(BINARY, AnalysisConfig::default()).run(&input, &output);
    assert!(matches!(result, Err(AnalysisError::Io { .. })));
}

#[test]
fn failing_stage_process_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("hvac.log");
    write_log(&input);

    // `false` starts fine and exits non-zero for every role
    let result = ProcessPipeline::new("false", AnalysisConfig::default()).run(&input, &dir.path().join("report.txt"));
    assert!(matches!(result, Err(AnalysisError::StageFailed { stage: Stage::Reader, .. })));
}

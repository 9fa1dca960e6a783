//! In-memory metrics accumulation and the end-of-run summary artifact.
//!
//! Scenarios record `(operation, member count, duration)` samples as they
//! go; at the end of the run the recorder folds them into one row per
//! operation/member-count pair, scores each row against the region-scaled
//! threshold, and renders a plain-text summary table suitable for
//! dropping into a bug report.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::time::Duration;

use mesh_client::MeshEnv;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::thresholds::{self, Region};

type SampleKey = (String, Option<u32>);

/// Collects duration samples for the lifetime of one run.
pub struct MetricsRecorder {
    region: Region,
    samples: Mutex<BTreeMap<SampleKey, Vec<f64>>>,
}

impl MetricsRecorder {
    #[must_use]
    pub fn new(region: Region) -> Self {
        Self {
            region,
            samples: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record one sample. A `-<count>` suffix on the operation name is
    /// folded into the member count when no explicit count is given.
    pub fn record(&self, operation: &str, member_count: Option<u32>, duration: Duration) {
        self.record_ms(operation, member_count, duration.as_secs_f64() * 1_000.0);
    }

    /// Record one sample with the duration already in milliseconds.
    pub fn record_ms(&self, operation: &str, member_count: Option<u32>, duration_ms: f64) {
        let (base_op, suffix_count) = thresholds::normalize_operation(operation);
        let members = member_count.or(suffix_count);
        self.samples
            .lock()
            .entry((base_op, members))
            .or_default()
            .push(duration_ms);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Fold all recorded samples into scored summary rows.
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let samples = self.samples.lock();
        let mut rows = Vec::with_capacity(samples.len());
        for ((operation, members), values) in samples.iter() {
            if values.is_empty() {
                continue;
            }
            let count = values.len();
            let sum: f64 = values.iter().sum();
            let average_ms = sum / count as f64;
            let min_ms = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max_ms = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let op_type = thresholds::classify_operation(operation, *members);
            let threshold_ms = thresholds::threshold_for(operation, op_type, *members, self.region);
            rows.push(SummaryRow {
                operation: operation.clone(),
                members: *members,
                samples: count,
                average_ms,
                min_ms,
                max_ms,
                threshold_ms,
                passed: average_ms <= threshold_ms as f64,
            });
        }
        let passed = rows.iter().filter(|row| row.passed).count();
        MetricsSummary {
            region: self.region,
            total: rows.len(),
            passed,
            rows,
        }
    }
}

/// One scored operation in the summary table.
#[derive(Clone, Debug, Serialize)]
pub struct SummaryRow {
    pub operation: String,
    pub members: Option<u32>,
    pub samples: usize,
    pub average_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub threshold_ms: u64,
    pub passed: bool,
}

impl SummaryRow {
    /// Signed gap between the average and its threshold, rounded.
    #[must_use]
    pub fn variance_ms(&self) -> i64 {
        (self.average_ms - self.threshold_ms as f64).round() as i64
    }
}

/// Scored snapshot of a run's metrics.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSummary {
    pub region: Region,
    pub rows: Vec<SummaryRow>,
    pub passed: usize,
    pub total: usize,
}

impl MetricsSummary {
    /// Fraction of rows within threshold, in percent. 100 when empty.
    #[must_use]
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.passed as f64 / self.total as f64 * 100.0
        }
    }

    /// Render the summary as a plain-text table.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::from("METRICS SUMMARY\n===============\n\n");
        out.push_str(
            "Operation | Members | Avg (ms) | Min/Max (ms) | Threshold (ms) | Variance (ms) | Status\n",
        );
        out.push_str(
            "----------|---------|----------|--------------|----------------|---------------|-------\n",
        );
        for row in &self.rows {
            let members = row
                .members
                .map_or_else(|| "-".to_owned(), |count| count.to_string());
            let variance = row.variance_ms();
            let variance = if variance > 0 {
                format!("+{variance}")
            } else {
                variance.to_string()
            };
            let status = if row.passed { "PASS" } else { "FAIL" };
            out.push_str(&format!(
                "{} | {} | {} | {}/{} | {} | {} | {}\n",
                row.operation,
                members,
                row.average_ms.round(),
                row.min_ms.round(),
                row.max_ms.round(),
                row.threshold_ms,
                variance,
                status,
            ));
        }
        out.push_str(&format!(
            "\nPassed: {}/{} metrics ({}%)\n",
            self.passed,
            self.total,
            self.pass_rate().round(),
        ));
        out
    }

    /// Write the rendered summary to `path`, creating parent directories.
    pub fn write_markdown(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_markdown())?;
        info!(
            path = %path.display(),
            passed = self.passed,
            total = self.total,
            "wrote metrics summary"
        );
        Ok(())
    }
}

/// Conventional summary file name for a run.
#[must_use]
pub fn summary_file_name(test_name: &str, region: Region, env: MeshEnv) -> String {
    format!("{test_name}-{region}-{env}.md")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn samples_aggregate_into_one_row() {
        let recorder = MetricsRecorder::new(Region::Us);
        recorder.record_ms("senddm", None, 100.0);
        recorder.record_ms("senddm", None, 200.0);
        recorder.record_ms("senddm", None, 300.0);

        let summary = recorder.summary();
        assert_eq!(summary.rows.len(), 1);
        let row = &summary.rows[0];
        assert_eq!(row.operation, "senddm");
        assert_eq!(row.samples, 3);
        assert_eq!(row.average_ms, 200.0);
        assert_eq!(row.min_ms, 100.0);
        assert_eq!(row.max_ms, 300.0);
        assert_eq!(row.threshold_ms, 350);
        assert!(row.passed);
    }

    #[test]
    fn member_suffix_selects_group_threshold() {
        let recorder = MetricsRecorder::new(Region::Us);
        recorder.record_ms("createGroup-10", None, 2_700.0);

        let summary = recorder.summary();
        let row = &summary.rows[0];
        assert_eq!(row.operation, "creategroup");
        assert_eq!(row.members, Some(10));
        assert_eq!(row.threshold_ms, 2_600);
        assert!(!row.passed);
        assert_eq!(row.variance_ms(), 100);
    }

    #[test]
    fn region_scaling_applies_to_summary_thresholds() {
        let recorder = MetricsRecorder::new(Region::Asia);
        recorder.record_ms("createdm", None, 1_500.0);

        let row = &recorder.summary().rows[0];
        assert_eq!(row.threshold_ms, 1_800);
        assert!(row.passed);
    }

    #[test]
    fn markdown_carries_status_and_variance() {
        let recorder = MetricsRecorder::new(Region::Us);
        recorder.record_ms("senddm", None, 150.0);
        recorder.record_ms("creategroup", Some(10), 3_000.0);

        let rendered = recorder.summary().to_markdown();
        assert!(rendered.starts_with("METRICS SUMMARY"));
        assert!(rendered.contains("senddm | - | 150 | 150/150 | 350 | -200 | PASS"));
        assert!(rendered.contains("creategroup | 10 | 3000 | 3000/3000 | 2600 | +400 | FAIL"));
        assert!(rendered.contains("Passed: 1/2 metrics (50%)"));
    }

    #[test]
    fn empty_recorder_summarizes_cleanly() {
        let recorder = MetricsRecorder::new(Region::Us);
        assert!(recorder.is_empty());
        let summary = recorder.summary();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.pass_rate(), 100.0);
    }

    #[test]
    fn write_markdown_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let recorder = MetricsRecorder::new(Region::Us);
        recorder.record_ms("senddm", None, 90.0);

        let file = dir
            .path()
            .join("logs")
            .join(summary_file_name("delivery", Region::Us, MeshEnv::Local));
        recorder.summary().write_markdown(&file).unwrap();
        let contents = std::fs::read_to_string(&file).unwrap();
        assert!(contents.contains("senddm"));
        assert!(file.ends_with("logs/delivery-us-local.md"));
    }
}

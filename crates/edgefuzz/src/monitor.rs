//! Run journal and cumulative-coverage bookkeeping.
//!
//! Every target run is recorded here. The monitor merges per-run bitmaps
//! into the cumulative map (caching the popcount so it is never re-scanned),
//! keeps a bounded history of coverage samples for growth-rate queries, and
//! saves high-novelty variants to disk.

use std::{
    collections::VecDeque,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    corpus::CandidateId,
    coverage::CoverageMap,
    execution::{RunResult, RunStatus},
    utils,
};

/// Default novelty threshold above which a variant is saved to disk.
pub const DEFAULT_NOVELTY_THRESHOLD: usize = 10;

/// How many (timestamp, cumulative-size) samples the growth ring keeps.
const COVERAGE_HISTORY_LIMIT: usize = 1024;

/// One journal entry per target run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: f64,
    pub sample_id: Option<CandidateId>,
    pub status: RunStatus,
    pub wall_time: f64,
    pub novelty: usize,
    pub cum_coverage: usize,
    pub artifact_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_tail: Option<String>,
}

#[derive(Debug)]
pub struct Monitor {
    artifacts_dir: PathBuf,
    records: Vec<RunRecord>,
    cumulative: CoverageMap,
    /// Cached `cumulative.popcount()`, advanced by each merge's novelty.
    cumulative_size: usize,
    novelty_threshold: usize,
    history: VecDeque<(f64, usize)>,
}

impl Monitor {
    pub fn new(artifacts_dir: PathBuf, novelty_threshold: usize) -> anyhow::Result<Self> {
        fs::create_dir_all(&artifacts_dir).with_context(|| {
            format!("Creating artifacts directory {}", artifacts_dir.display())
        })?;
        Ok(Self {
            artifacts_dir,
            records: Vec::new(),
            cumulative: CoverageMap::new(),
            cumulative_size: 0,
            novelty_threshold,
            history: VecDeque::new(),
        })
    }

    /// Records one run, merging its coverage into the cumulative map.
    /// Returns the novelty (edges newly covered by this run).
    pub fn record_run(
        &mut self,
        sample_id: Option<CandidateId>,
        sample: &[u8],
        result: &RunResult,
    ) -> usize {
        let timestamp = utils::unix_time_secs();

        let novelty = match &result.coverage {
            Some(coverage) => self.cumulative.merge_and_count_new(coverage),
            None => 0,
        };
        self.cumulative_size += novelty;

        self.history.push_back((timestamp, self.cumulative_size));
        if self.history.len() > COVERAGE_HISTORY_LIMIT {
            self.history.pop_front();
        }

        let mut artifact_path = result.artifact_path.clone();
        if novelty >= self.novelty_threshold {
            match self.save_novel_sample(sample) {
                Ok(path) => {
                    debug!(novelty, path = %path.display(), "Saved high-novelty sample");
                    artifact_path.get_or_insert(path);
                }
                Err(err) => warn!(%err, "Saving high-novelty sample"),
            }
        }

        self.records.push(RunRecord {
            timestamp,
            sample_id,
            status: result.status,
            wall_time: result.wall_time.as_secs_f64(),
            novelty,
            cum_coverage: self.cumulative_size,
            artifact_path,
            stderr_tail: result
                .stderr_tail
                .as_ref()
                .map(|tail| String::from_utf8_lossy(tail).into_owned()),
        });

        novelty
    }

    fn save_novel_sample(&self, sample: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self
            .artifacts_dir
            .join(format!("sample_{}_novel.bin", utils::unix_time_millis()));
        fs::write(&path, sample).with_context(|| format!("Writing {}", path.display()))?;
        Ok(path)
    }

    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    pub fn cumulative_coverage(&self) -> usize {
        self.cumulative_size
    }

    pub fn cumulative_map(&self) -> &CoverageMap {
        &self.cumulative
    }

    pub fn crash_count(&self) -> usize {
        self.status_count(RunStatus::Crash)
    }

    pub fn hang_count(&self) -> usize {
        self.status_count(RunStatus::Hang)
    }

    pub fn novelty_hit_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.novelty >= self.novelty_threshold)
            .count()
    }

    fn status_count(&self, status: RunStatus) -> usize {
        self.records
            .iter()
            .filter(|record| record.status == status)
            .count()
    }

    /// Average new edges per second over the trailing window.
    pub fn growth_rate(&self, window_seconds: f64) -> f64 {
        let Some((last_ts, last_cov)) = self.history.back().copied() else {
            return 0.0;
        };
        let cutoff = utils::unix_time_secs() - window_seconds;
        let baseline = self
            .history
            .iter()
            .rev()
            .find(|(ts, _)| *ts <= cutoff)
            .or_else(|| self.history.front())
            .copied();
        let Some((base_ts, base_cov)) = baseline else {
            return 0.0;
        };
        let delta_cov = last_cov.saturating_sub(base_cov) as f64;
        let delta_t = (last_ts - base_ts).max(1e-6);
        delta_cov / delta_t
    }

    /// True when both the growth rate and the absolute edge delta inside
    /// the window fall below their thresholds.
    pub fn is_growth_slow(&self, window_seconds: f64, min_rate: f64, min_delta: usize) -> bool {
        if self.history.is_empty() {
            return false;
        }
        let cutoff = utils::unix_time_secs() - window_seconds;
        let first = self
            .history
            .iter()
            .find(|(ts, _)| *ts >= cutoff)
            .or_else(|| self.history.front())
            .copied();
        let (Some((first_ts, first_cov)), Some((last_ts, last_cov))) =
            (first, self.history.back().copied())
        else {
            return false;
        };
        let delta_cov = last_cov.saturating_sub(first_cov);
        let delta_t = (last_ts - first_ts).max(1e-6);
        let rate = delta_cov as f64 / delta_t;
        rate < min_rate && delta_cov < min_delta
    }

    /// Serializes the journal as a JSON array.
    pub fn export_records(&self, path: &Path) -> anyhow::Result<()> {
        let file = fs::File::create(path)
            .with_context(|| format!("Creating journal file {}", path.display()))?;
        serde_json::to_writer_pretty(file, &self.records).context("Serializing run records")?;
        Ok(())
    }

    /// Coverage as a function of elapsed seconds since the first record.
    pub fn coverage_curve(&self) -> Vec<(f64, usize)> {
        let Some(first) = self.records.first() else {
            return Vec::new();
        };
        let start = first.timestamp;
        self.records
            .iter()
            .map(|record| (record.timestamp - start, record.cum_coverage))
            .collect()
    }

    /// Writes the coverage curve as CSV with a `time_sec,cumulative_coverage`
    /// header; an empty journal still produces the header row.
    pub fn export_curve_csv(&self, path: &Path) -> anyhow::Result<()> {
        let mut file = fs::File::create(path)
            .with_context(|| format!("Creating coverage curve file {}", path.display()))?;
        writeln!(file, "time_sec,cumulative_coverage").context("Writing CSV header")?;
        for (elapsed, coverage) in self.coverage_curve() {
            writeln!(file, "{elapsed:.6},{coverage}").context("Writing CSV row")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn monitor_in(dir: &Path) -> Monitor {
        Monitor::new(dir.join("monitor_artifacts"), DEFAULT_NOVELTY_THRESHOLD).unwrap()
    }

    fn result_with_edges(edges: &[usize]) -> RunResult {
        let mut coverage = CoverageMap::new();
        for edge in edges {
            coverage.add(*edge);
        }
        RunResult {
            status: RunStatus::Ok,
            exit_code: Some(0),
            timed_out: false,
            wall_time: Duration::from_millis(5),
            stderr_tail: None,
            coverage: Some(coverage),
            artifact_path: None,
        }
    }

    #[test]
    fn cumulative_coverage_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor_in(dir.path());
        let mut previous = 0;
        for edges in [&[1usize, 2][..], &[2, 3][..], &[1][..], &[9, 10, 11][..]] {
            monitor.record_run(None, b"x", &result_with_edges(edges));
            let current = monitor.cumulative_coverage();
            assert!(current >= previous);
            previous = current;
        }
        assert_eq!(previous, 6);
        assert_eq!(monitor.cumulative_map().popcount(), 6);
    }

    #[test]
    fn novelty_is_the_merge_delta() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor_in(dir.path());
        assert_eq!(monitor.record_run(None, b"x", &result_with_edges(&[1, 2])), 2);
        assert_eq!(monitor.record_run(None, b"x", &result_with_edges(&[2, 3])), 1);
        assert_eq!(monitor.record_run(None, b"x", &result_with_edges(&[1, 2, 3])), 0);
    }

    #[test]
    fn missing_coverage_records_zero_novelty() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor_in(dir.path());
        let mut result = result_with_edges(&[]);
        result.coverage = None;
        assert_eq!(monitor.record_run(None, b"x", &result), 0);
        assert_eq!(monitor.records().len(), 1);
    }

    #[test]
    fn high_novelty_sample_is_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = Monitor::new(dir.path().join("monitor_artifacts"), 2).unwrap();
        monitor.record_run(None, b"novel bytes", &result_with_edges(&[1, 2, 3]));
        let record = &monitor.records()[0];
        let saved = record.artifact_path.as_ref().expect("sample saved");
        assert_eq!(fs::read(saved).unwrap(), b"novel bytes");
        assert!(
            saved
                .file_name()
                .unwrap()
                .to_string_lossy()
                .ends_with("_novel.bin")
        );
    }

    #[test]
    fn export_writes_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor_in(dir.path());
        monitor.record_run(Some(CandidateId(1)), b"x", &result_with_edges(&[4]));
        let path = dir.path().join("monitor_records.json");
        monitor.export_records(&path).unwrap();
        let parsed: Vec<RunRecord> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].sample_id, Some(CandidateId(1)));
        assert_eq!(parsed[0].status, RunStatus::Ok);
    }

    #[test]
    fn empty_curve_still_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor_in(dir.path());
        let path = dir.path().join("coverage_curve.csv");
        monitor.export_curve_csv(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "time_sec,cumulative_coverage\n"
        );
    }

    #[test]
    fn growth_rate_sees_recent_novelty() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor_in(dir.path());
        monitor.record_run(None, b"x", &result_with_edges(&[1, 2, 3, 4]));
        monitor.record_run(None, b"x", &result_with_edges(&[5, 6, 7, 8]));
        assert!(monitor.growth_rate(60.0) > 0.0);
        assert!(!monitor.is_growth_slow(60.0, 0.02, 2));
    }

    #[test]
    fn stagnant_journal_reports_slow_growth() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor_in(dir.path());
        for _ in 0..5 {
            monitor.record_run(None, b"x", &result_with_edges(&[1]));
        }
        assert!(monitor.is_growth_slow(60.0, 0.02, 2));
    }
}

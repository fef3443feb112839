//! The main fuzzing loop.
//!
//! Single-threaded and cooperative: every iteration selects a candidate,
//! picks a mutation policy, runs the target once per variant, and feeds
//! each outcome to the monitor and then the scheduler (in that order). An
//! optional reporter thread prints periodic status from a set of shared
//! counters; it never touches engine state.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use tracing::{debug, info, warn};

use crate::{
    aggression::AggressionManager,
    config::Config,
    execution::{RunStatus, TargetRunner},
    format::{self, SeedFormat},
    monitor::Monitor,
    mutators::{
        ArithMutator, BitFlipMutator, CompositeMutator, ElfMutator, HavocMutator, InterestMutator,
        JpegMutator, Mutator, PcapMutator, PngMutator, ScriptDialect, ScriptMutator,
        SpliceMutator, XmlMutator,
    },
    scheduler::Scheduler,
};

const IDLE_SLEEP: Duration = Duration::from_millis(200);
const ERROR_SLEEP: Duration = Duration::from_millis(50);
const AGGRESSION_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const GROWTH_WINDOW_SECONDS: f64 = 30.0;
const GROWTH_MIN_RATE: f64 = 0.02;
const GROWTH_MIN_DELTA: usize = 2;
const SNAPSHOT_REFRESH_SELECTIONS: u64 = 50;

/// Counters the reporter thread reads; updated by the loop without any
/// synchronization beyond the atomics themselves.
#[derive(Debug, Default)]
pub struct CampaignStats {
    pub records: AtomicU64,
    pub corpus_size: AtomicU64,
    pub cumulative_coverage: AtomicU64,
    pub crashes: AtomicU64,
    pub hangs: AtomicU64,
}

/// End-of-run totals, also logged as the campaign summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CampaignSummary {
    pub total_runs: usize,
    pub crashes: usize,
    pub hangs: usize,
    pub novelty_hits: usize,
    pub cumulative_coverage: usize,
    pub corpus_size: usize,
}

#[derive(Debug)]
pub struct Campaign<R> {
    config: Config,
    runner: R,
    scheduler: Scheduler,
    monitor: Monitor,
    aggression: AggressionManager,
    basic: Vec<Mutator>,
    specialized: HashMap<SeedFormat, Mutator>,
    rng: SmallRng,
    out_dir: PathBuf,
    stats: Arc<CampaignStats>,
    stop: Arc<AtomicBool>,
    /// Latest slow-growth observation, driving the mutation policy.
    growth_slow: bool,
    seed_counter: u64,
}

impl<R: TargetRunner> Campaign<R> {
    pub fn new(config: Config, runner: R, out_dir: PathBuf) -> anyhow::Result<Self> {
        let monitor = Monitor::new(
            out_dir.join("monitor_artifacts"),
            config.novelty_threshold,
        )
        .context("Creating monitor")?;
        let scheduler = Scheduler::new(config.scheduler, config.random_seed);
        let aggression = AggressionManager::new(config.aggression);
        let mut seed_counter = config.random_seed;
        let basic = vec![
            Mutator::BitFlip(BitFlipMutator::new(next_seed(&mut seed_counter))),
            Mutator::Arith(ArithMutator::new(next_seed(&mut seed_counter))),
            Mutator::Interest(InterestMutator::new(next_seed(&mut seed_counter))),
            Mutator::Havoc(HavocMutator::new(next_seed(&mut seed_counter))),
            Mutator::Splice(SpliceMutator::new(next_seed(&mut seed_counter))),
        ];
        Ok(Self {
            rng: SmallRng::seed_from_u64(next_seed(&mut seed_counter)),
            config,
            runner,
            scheduler,
            monitor,
            aggression,
            basic,
            specialized: HashMap::new(),
            out_dir,
            stats: Arc::new(CampaignStats::default()),
            stop: Arc::new(AtomicBool::new(false)),
            growth_slow: false,
            seed_counter,
        })
    }

    /// Imports one seed input verbatim.
    pub fn add_seed(&mut self, data: Vec<u8>) {
        self.scheduler.add_seed(data);
    }

    pub fn corpus_size(&self) -> usize {
        self.scheduler.corpus_len()
    }

    /// Cooperative cancellation handle (wire this to SIGINT).
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stats_handle(&self) -> Arc<CampaignStats> {
        Arc::clone(&self.stats)
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Runs the campaign until the deadline or a stop signal, then exports
    /// the journal and coverage curve.
    pub fn run(&mut self) -> anyhow::Result<CampaignSummary> {
        let start = Instant::now();
        let deadline = start + self.config.runtime;
        info!(
            runtime_secs = self.config.runtime.as_secs(),
            corpus = self.scheduler.corpus_len(),
            "Fuzzing campaign starting"
        );

        let reporter = self.spawn_reporter(start, deadline);

        let mut last_aggression_check = Instant::now();
        let mut last_snapshot_refresh = 0u64;
        let mut selections = 0u64;

        'outer: while Instant::now() < deadline && !self.stop.load(Ordering::Relaxed) {
            let Some(candidate) = self.scheduler.next_candidate() else {
                thread::sleep(IDLE_SLEEP.min(deadline.saturating_duration_since(Instant::now())));
                continue;
            };
            selections += 1;

            self.config.refresh_from_env();

            if last_aggression_check.elapsed() >= AGGRESSION_CHECK_INTERVAL {
                last_aggression_check = Instant::now();
                self.growth_slow = self.monitor.is_growth_slow(
                    GROWTH_WINDOW_SECONDS,
                    GROWTH_MIN_RATE,
                    GROWTH_MIN_DELTA,
                );
                if self.aggression.update(self.growth_slow) {
                    let scale = self.aggression.scale();
                    if self.aggression.is_aggressive() {
                        info!(scale, "Entering aggressive mutation mode");
                        for mutator in &mut self.basic {
                            mutator.apply_aggression(scale);
                        }
                    } else {
                        info!("Leaving aggressive mutation mode");
                        for mutator in &mut self.basic {
                            mutator.clear_aggression();
                        }
                    }
                }
            }
            self.scheduler
                .note_cumulative_coverage(self.monitor.cumulative_coverage());

            if selections - last_snapshot_refresh >= SNAPSHOT_REFRESH_SELECTIONS
                || last_snapshot_refresh == 0
            {
                last_snapshot_refresh = selections;
                let snapshot = self
                    .scheduler
                    .input_snapshot(self.config.corpus_snapshot_limit);
                for mutator in &mut self.basic {
                    mutator.set_corpus(&snapshot);
                }
                for mutator in self.specialized.values_mut() {
                    mutator.set_corpus(&snapshot);
                }
            }

            let seed_format = format::detect(&candidate.data);
            let attempts = candidate.energy.clamp(1, self.config.max_attempts);

            for _ in 0..attempts {
                let variants = self.generate_variants(&candidate.data, seed_format);
                for variant in variants.into_iter().take(self.config.max_variants) {
                    if Instant::now() >= deadline || self.stop.load(Ordering::Relaxed) {
                        break 'outer;
                    }
                    let result =
                        self.runner
                            .run(&variant, self.config.input_mode, self.config.run_timeout);
                    if result.status == RunStatus::Error {
                        thread::sleep(ERROR_SLEEP);
                    }
                    let novelty = self.monitor.record_run(Some(candidate.id), &variant, &result);
                    self.scheduler.report_result(&variant, &result, novelty);
                    self.publish_stats(&result);
                }
            }
        }

        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = reporter {
            let _ = handle.join();
        }
        self.finish()
    }

    /// Picks a generator for one attempt under the current policy and
    /// returns its variant batch. Mutator failures degrade to an empty
    /// batch; the loop simply moves on.
    fn generate_variants(&mut self, data: &[u8], seed_format: SeedFormat) -> Vec<Vec<u8>> {
        let composite_probability = if self.growth_slow {
            self.config.composite_probability_slow
        } else {
            self.config.composite_probability
        };

        if self.rng.random_bool(composite_probability) {
            let mut composite = self.build_composite(seed_format);
            return composite.mutate(data);
        }

        let has_specialized = self.ensure_specialized(seed_format);
        let prefer_specialized = if self.growth_slow {
            // Slow policy: mostly basic mutators.
            self.rng.random_bool(1.0 - self.config.specialized_bias)
        } else {
            self.rng.random_bool(self.config.specialized_bias)
        };

        if has_specialized && prefer_specialized {
            let mutator = self
                .specialized
                .get_mut(&seed_format)
                .expect("ensure_specialized inserted the mutator");
            mutator.mutate(data)
        } else {
            let index = self.rng.random_range(0..self.basic.len());
            self.basic[index].mutate(data)
        }
    }

    /// Builds a fresh composite over the basic set plus the specialized
    /// mutator for this format, inheriting the current aggression state.
    fn build_composite(&mut self, seed_format: SeedFormat) -> CompositeMutator {
        let snapshot = self
            .scheduler
            .input_snapshot(self.config.corpus_snapshot_limit);
        let mut pool = vec![
            Mutator::BitFlip(BitFlipMutator::new(next_seed(&mut self.seed_counter))),
            Mutator::Arith(ArithMutator::new(next_seed(&mut self.seed_counter))),
            Mutator::Interest(InterestMutator::new(next_seed(&mut self.seed_counter))),
            Mutator::Havoc(HavocMutator::new(next_seed(&mut self.seed_counter))),
            Mutator::Splice(SpliceMutator::new(next_seed(&mut self.seed_counter))),
        ];
        if let Some(specialized) = self.make_specialized(seed_format) {
            pool.push(specialized);
        }
        for mutator in &mut pool {
            mutator.set_corpus(&snapshot);
        }
        let mut composite = CompositeMutator::new(
            next_seed(&mut self.seed_counter),
            pool,
            self.config.composite_max_calls,
            self.config.composite_per_call,
        );
        if self.aggression.is_aggressive() {
            composite.apply_aggression(self.aggression.scale());
        }
        composite
    }

    /// Instantiates the specialized mutator for `seed_format` on first use.
    fn ensure_specialized(&mut self, seed_format: SeedFormat) -> bool {
        if self.specialized.contains_key(&seed_format) {
            return true;
        }
        match self.make_specialized(seed_format) {
            Some(mutator) => {
                debug!(format = %seed_format, name = mutator.name(), "Specialized mutator selected");
                self.specialized.insert(seed_format, mutator);
                true
            }
            None => false,
        }
    }

    fn make_specialized(&mut self, seed_format: SeedFormat) -> Option<Mutator> {
        let seed = next_seed(&mut self.seed_counter);
        let mutator = match seed_format {
            SeedFormat::Elf => Mutator::Elf(ElfMutator::new(seed)),
            SeedFormat::Png => {
                Mutator::Png(PngMutator::with_safe_mode(seed, self.config.png_safe_mode))
            }
            SeedFormat::Jpeg => Mutator::Jpeg(JpegMutator::new(seed)),
            SeedFormat::Pcap => Mutator::Pcap(PcapMutator::new(seed)),
            SeedFormat::Xml => Mutator::Xml(XmlMutator::new(seed)),
            SeedFormat::Lua => Mutator::Script(ScriptMutator::new(seed, ScriptDialect::Lua)),
            SeedFormat::Mjs => Mutator::Script(ScriptMutator::new(seed, ScriptDialect::Mjs)),
            SeedFormat::Other => return None,
        };
        Some(mutator)
    }

    fn publish_stats(&self, result: &crate::execution::RunResult) {
        self.stats
            .records
            .store(self.monitor.records().len() as u64, Ordering::Relaxed);
        self.stats
            .corpus_size
            .store(self.scheduler.corpus_len() as u64, Ordering::Relaxed);
        self.stats
            .cumulative_coverage
            .store(self.monitor.cumulative_coverage() as u64, Ordering::Relaxed);
        match result.status {
            RunStatus::Crash => {
                self.stats.crashes.fetch_add(1, Ordering::Relaxed);
            }
            RunStatus::Hang => {
                self.stats.hangs.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn spawn_reporter(
        &self,
        start: Instant,
        deadline: Instant,
    ) -> Option<thread::JoinHandle<()>> {
        let interval = self.config.status_interval?;
        let stats = Arc::clone(&self.stats);
        let stop = Arc::clone(&self.stop);
        Some(thread::spawn(move || {
            let mut next_report = Instant::now() + interval;
            while !stop.load(Ordering::Relaxed) && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(100));
                if Instant::now() < next_report {
                    continue;
                }
                next_report = Instant::now() + interval;
                let elapsed = start.elapsed().as_secs_f64();
                let records = stats.records.load(Ordering::Relaxed);
                let rate = if elapsed > 0.0 {
                    records as f64 / elapsed
                } else {
                    0.0
                };
                info!(
                    elapsed_secs = elapsed as u64,
                    remaining_secs =
                        deadline.saturating_duration_since(Instant::now()).as_secs(),
                    corpus = stats.corpus_size.load(Ordering::Relaxed),
                    records,
                    rate = format!("{rate:.2}"),
                    cumulative_coverage = stats.cumulative_coverage.load(Ordering::Relaxed),
                    crashes = stats.crashes.load(Ordering::Relaxed),
                    hangs = stats.hangs.load(Ordering::Relaxed),
                    "status"
                );
            }
        }))
    }

    /// Exports the journal and coverage curve, logs the summary.
    fn finish(&self) -> anyhow::Result<CampaignSummary> {
        let records_path = self.out_dir.join("monitor_records.json");
        match self.monitor.export_records(&records_path) {
            Ok(()) => info!(path = %records_path.display(), "Run journal exported"),
            Err(err) => warn!(%err, "Exporting run journal"),
        }
        let curve_path = self.out_dir.join("coverage_curve.csv");
        match self.monitor.export_curve_csv(&curve_path) {
            Ok(()) => info!(path = %curve_path.display(), "Coverage curve exported"),
            Err(err) => warn!(%err, "Exporting coverage curve"),
        }

        let summary = CampaignSummary {
            total_runs: self.monitor.records().len(),
            crashes: self.monitor.crash_count(),
            hangs: self.monitor.hang_count(),
            novelty_hits: self.monitor.novelty_hit_count(),
            cumulative_coverage: self.monitor.cumulative_coverage(),
            corpus_size: self.scheduler.corpus_len(),
        };
        info!(
            total_runs = summary.total_runs,
            crashes = summary.crashes,
            hangs = summary.hangs,
            novelty_hits = summary.novelty_hits,
            cumulative_coverage = summary.cumulative_coverage,
            corpus = summary.corpus_size,
            "Fuzzing campaign finished"
        );
        Ok(summary)
    }
}

fn next_seed(counter: &mut u64) -> u64 {
    *counter = counter.wrapping_add(0x9e37_79b9_7f4a_7c15);
    *counter
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::execution::TargetCommand;

    fn test_config(runtime_ms: u64) -> Config {
        Config {
            runtime: Duration::from_millis(runtime_ms),
            run_timeout: Duration::from_secs(2),
            status_interval: None,
            random_seed: 7,
            ..Config::default()
        }
    }

    fn shell_campaign(
        script: &str,
        config: Config,
        out_dir: &std::path::Path,
    ) -> Campaign<TargetCommand> {
        let runner = TargetCommand::new(
            vec!["/bin/sh".into(), "-c".into(), script.into()],
            Some(out_dir.join("work")),
            4096,
        );
        Campaign::new(config, runner, out_dir.to_path_buf()).unwrap()
    }

    #[test]
    fn empty_corpus_exits_at_deadline_with_empty_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = shell_campaign("exit 0", test_config(400), dir.path());
        let summary = campaign.run().unwrap();
        assert_eq!(summary.total_runs, 0);
        assert_eq!(summary.cumulative_coverage, 0);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("coverage_curve.csv")).unwrap(),
            "time_sec,cumulative_coverage\n"
        );
        let records: Vec<serde_json::Value> = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("monitor_records.json")).unwrap(),
        )
        .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn instantaneous_ok_target_records_ok_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = shell_campaign("exit 0", test_config(1200), dir.path());
        campaign.add_seed(b"seed".to_vec());
        let summary = campaign.run().unwrap();
        assert!(summary.total_runs > 0);
        assert_eq!(summary.crashes, 0);
        assert!(
            campaign
                .monitor()
                .records()
                .iter()
                .all(|record| record.status == RunStatus::Ok)
        );
    }

    #[test]
    fn always_crashing_target_accumulates_artifacts_without_corpus_growth() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = shell_campaign("exit 1", test_config(1200), dir.path());
        campaign.add_seed(b"Y".to_vec());
        let summary = campaign.run().unwrap();
        assert!(summary.crashes > 0);
        // Crash variants are never admitted.
        assert_eq!(summary.corpus_size, 1);
        let artifact_dir = dir.path().join("work").join("artifacts");
        let artifacts: Vec<_> = std::fs::read_dir(&artifact_dir).unwrap().collect();
        assert!(!artifacts.is_empty());
    }

    #[test]
    fn hanging_target_is_bounded_by_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(1000);
        config.run_timeout = Duration::from_millis(100);
        let mut campaign = shell_campaign("sleep 30", config, dir.path());
        campaign.add_seed(b"SLOW".to_vec());
        let started = Instant::now();
        let summary = campaign.run().unwrap();
        // Runtime plus one timeout's worth of slack plus the kill grace.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(summary.hangs > 0);
        assert_eq!(summary.crashes, 0);
        assert!(
            campaign
                .monitor()
                .records()
                .iter()
                .all(|record| record.status == RunStatus::Hang)
        );
    }

    #[test]
    fn stop_handle_terminates_the_loop_early() {
        let dir = tempfile::tempdir().unwrap();
        let mut campaign = shell_campaign("exit 0", test_config(60_000), dir.path());
        campaign.add_seed(b"seed".to_vec());
        let stop = campaign.stop_handle();
        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            stop.store(true, Ordering::Relaxed);
        });
        let started = Instant::now();
        campaign.run().unwrap();
        killer.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}

use std::{
    fs,
    path::PathBuf,
    process,
    sync::atomic::Ordering,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use edgefuzz::{
    campaign::Campaign,
    config::Config,
    coverage::MAP_SIZE,
    execution::{InputMode, TargetCommand},
};
use tracing::{error, info, warn};
use walkdir::WalkDir;

mod exit_code {
    pub const TARGET_MISSING: i32 = 2;
    pub const SEEDS_MISSING: i32 = 3;
    pub const OUTDIR_FAILURE: i32 = 4;
}

#[derive(Debug, clap::Parser)]
pub(super) struct FuzzCommand {
    /// Target command and arguments. In file mode, `@@` tokens are
    /// replaced by the input file path; without one the path is appended.
    #[clap(long, required = true, num_args = 1.., value_name = "CMD")]
    target: Vec<String>,

    /// Directory of seed inputs, loaded verbatim.
    #[clap(long)]
    seeds: PathBuf,

    /// Output directory for artifacts, the run journal, and the coverage
    /// curve.
    #[clap(long)]
    outdir: PathBuf,

    /// Fuzzing time in seconds.
    #[clap(long, default_value_t = 3600)]
    time: u64,

    /// How the input reaches the target.
    #[clap(long, value_enum, default_value_t = InputMode::Stdin)]
    mode: InputMode,

    /// Per-run timeout in seconds.
    #[clap(long, default_value_t = 1.0)]
    timeout: f64,

    /// Status print interval in seconds (0 disables).
    #[clap(long, default_value_t = 5)]
    status_interval: u64,
}

impl FuzzCommand {
    pub(super) fn run(self, global_options: super::GlobalOptions) -> anyhow::Result<()> {
        let target_binary = PathBuf::from(&self.target[0]);
        if !target_binary.exists() {
            error!(target = %target_binary.display(), "Target not found");
            process::exit(exit_code::TARGET_MISSING);
        }
        if !self.seeds.is_dir() {
            error!(seeds = %self.seeds.display(), "Seeds directory not found");
            process::exit(exit_code::SEEDS_MISSING);
        }
        if let Err(err) = fs::create_dir_all(&self.outdir) {
            error!(outdir = %self.outdir.display(), %err, "Cannot create output directory");
            process::exit(exit_code::OUTDIR_FAILURE);
        }

        let random_seed = global_options.random_seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .subsec_nanos()
                .into()
        });

        let mut config = Config {
            input_mode: self.mode,
            run_timeout: Duration::from_secs_f64(self.timeout),
            runtime: Duration::from_secs(self.time),
            status_interval: (self.status_interval > 0)
                .then(|| Duration::from_secs(self.status_interval)),
            random_seed,
            ..Config::default()
        };
        config.refresh_from_env();

        info!(
            target = %self.target.join(" "),
            seeds = %self.seeds.display(),
            outdir = %self.outdir.display(),
            time_secs = self.time,
            mode = ?self.mode,
            timeout_secs = self.timeout,
            "Configuration loaded"
        );

        // Persistent work directory so crash artifacts survive the runs
        // that produced them.
        let runner = TargetCommand::new(
            self.target.clone(),
            Some(self.outdir.join("work")),
            MAP_SIZE,
        );
        let mut campaign = Campaign::new(config, runner, self.outdir.clone())
            .context("Setting up campaign")?;

        let imported = load_seeds(&self.seeds, &mut campaign);
        info!(
            corpus_size = campaign.corpus_size(),
            imported, "Seed inputs imported"
        );

        let stop = campaign.stop_handle();
        ctrlc::set_handler(move || {
            warn!("Interrupt received, shutting down");
            stop.store(true, Ordering::Relaxed);
        })
        .context("Installing interrupt handler")?;

        campaign.run().context("Running fuzzing campaign")?;
        Ok(())
    }
}

/// Loads every regular file under the seeds directory verbatim; files that
/// cannot be read are skipped.
fn load_seeds(seeds_dir: &std::path::Path, campaign: &mut Campaign<TargetCommand>) -> usize {
    let mut imported = 0;
    for entry in WalkDir::new(seeds_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
    {
        match fs::read(entry.path()) {
            Ok(data) => {
                campaign.add_seed(data);
                imported += 1;
            }
            Err(err) => {
                warn!(path = %entry.path().display(), %err, "Skipping unreadable seed");
            }
        }
    }
    imported
}

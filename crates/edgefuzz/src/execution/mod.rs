//! Target execution: one fresh process per fuzzing iteration.
//!
//! Every run allocates its own shared-memory region for the coverage
//! bitmap, launches the target in a new process group, enforces the
//! timeout by signalling that group, and normalizes the outcome into a
//! [`RunResult`]. The runner sits behind [`TargetRunner`] so a forkserver
//! fast path can replace it without touching scheduler or mutator code.

use std::{
    fs,
    io::{self, Read, Write},
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use derive_new::new as New;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::{
    coverage::{self, CoverageMap},
    utils,
};

pub mod shared_memory;

use shared_memory::ShmRegion;

/// Environment variable carrying the shared-memory id to the instrumented
/// child, in decimal ASCII. This is the AFL compatibility surface and must
/// stay bit-exact.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// Placeholder in target argv tokens replaced by the input file path.
pub const INPUT_PLACEHOLDER: &str = "@@";

const MAP_DUMP_FILE: &str = "afl_showmap.out";
const STREAM_TAIL_LIMIT: usize = 4096;
const KILL_GRACE: Duration = Duration::from_millis(500);
const WAIT_POLL: Duration = Duration::from_millis(2);

/// How the input bytes reach the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, derive_more::Display)]
pub enum InputMode {
    /// Bytes are written to the child's standard input.
    #[display("stdin")]
    Stdin,
    /// Bytes are written to a temp file whose path is passed as an argument.
    #[display("file")]
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Crash,
    Hang,
    Error,
}

/// Normalized outcome of one target run.
#[derive(Debug)]
pub struct RunResult {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub wall_time: Duration,
    pub stderr_tail: Option<Vec<u8>>,
    pub coverage: Option<CoverageMap>,
    pub artifact_path: Option<PathBuf>,
}

impl RunResult {
    fn launch_failure(error: &io::Error, wall_time: Duration) -> Self {
        Self {
            status: RunStatus::Error,
            exit_code: None,
            timed_out: false,
            wall_time,
            stderr_tail: Some(error.to_string().into_bytes()),
            coverage: None,
            artifact_path: None,
        }
    }
}

/// Abstraction over the execution strategy.
pub trait TargetRunner {
    fn run(&mut self, input: &[u8], mode: InputMode, timeout: Duration) -> RunResult;
}

#[derive(Debug)]
enum WorkDir {
    Persistent(PathBuf),
    Temp(TempDir),
}

impl WorkDir {
    fn path(&self) -> &Path {
        match self {
            WorkDir::Persistent(path) => path,
            WorkDir::Temp(dir) => dir.path(),
        }
    }
}

/// Fresh-process runner: spawns the target command once per input.
///
/// `argv` is the full target command line; tokens containing `@@` are
/// substituted with the input path in file mode. When `work_dir` is `None`
/// every run gets a temporary directory that is removed at run end (crash
/// artifacts then vanish with it; callers that want them pass a persistent
/// directory).
#[derive(Debug, New)]
pub struct TargetCommand {
    argv: Vec<String>,
    work_dir: Option<PathBuf>,
    map_size: usize,
}

impl TargetCommand {
    fn resolve_work_dir(&self) -> io::Result<WorkDir> {
        match &self.work_dir {
            Some(path) => {
                fs::create_dir_all(path)?;
                Ok(WorkDir::Persistent(path.clone()))
            }
            None => {
                let dir = tempfile::Builder::new().prefix("edgefuzz_run_").tempdir()?;
                Ok(WorkDir::Temp(dir))
            }
        }
    }

    /// Builds the final argv for this run, applying `@@` substitution.
    fn build_argv(&self, input_path: Option<&Path>) -> Vec<String> {
        let Some(input_path) = input_path else {
            return self.argv.clone();
        };
        let input_str = input_path.to_string_lossy();
        let mut argv: Vec<String> = Vec::with_capacity(self.argv.len() + 1);
        let mut substituted = false;
        for token in &self.argv {
            if token.contains(INPUT_PLACEHOLDER) {
                argv.push(token.replace(INPUT_PLACEHOLDER, &input_str));
                substituted = true;
            } else {
                argv.push(token.clone());
            }
        }
        if !substituted {
            argv.push(input_str.into_owned());
        }
        argv
    }
}

impl TargetRunner for TargetCommand {
    fn run(&mut self, input: &[u8], mode: InputMode, timeout: Duration) -> RunResult {
        let start = Instant::now();

        let work_dir = match self.resolve_work_dir() {
            Ok(dir) => dir,
            Err(err) => return RunResult::launch_failure(&err, start.elapsed()),
        };

        // One region per run; retried once on allocation failure.
        let region = match ShmRegion::new(self.map_size) {
            Ok(region) => region,
            Err(first) => match ShmRegion::new(self.map_size) {
                Ok(region) => {
                    warn!(%first, "Shared memory allocation succeeded on retry");
                    region
                }
                Err(second) => {
                    warn!(%second, "Shared memory allocation failed twice");
                    return RunResult::launch_failure(
                        &io::Error::other(second.to_string()),
                        start.elapsed(),
                    );
                }
            },
        };

        let input_file = match mode {
            InputMode::File => {
                match tempfile::Builder::new()
                    .prefix("input_")
                    .tempfile_in(work_dir.path())
                {
                    Ok(mut file) => {
                        if let Err(err) = file.write_all(input) {
                            return RunResult::launch_failure(&err, start.elapsed());
                        }
                        Some(file)
                    }
                    Err(err) => return RunResult::launch_failure(&err, start.elapsed()),
                }
            }
            InputMode::Stdin => None,
        };

        let argv = self.build_argv(input_file.as_ref().map(|file| file.path()));
        let Some((program, args)) = argv.split_first() else {
            return RunResult::launch_failure(
                &io::Error::new(io::ErrorKind::InvalidInput, "empty target command"),
                start.elapsed(),
            );
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .env(SHM_ENV_VAR, region.id().to_string())
            .current_dir(work_dir.path())
            .stdin(match mode {
                InputMode::Stdin => Stdio::piped(),
                InputMode::File => Stdio::null(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so the timeout path can signal the target
            // together with anything it spawned.
            .process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return RunResult::launch_failure(&err, start.elapsed()),
        };

        let stdout_capture = child.stdout.take().map(spawn_tail_reader);
        let stderr_capture = child.stderr.take().map(spawn_tail_reader);

        // Feed stdin off-thread: a target that never reads would otherwise
        // block us here and keep the timeout from ever firing. The writer
        // exits with EPIPE once the child dies or is killed.
        let stdin_writer = child.stdin.take().map(|mut stdin| {
            let bytes = input.to_vec();
            thread::spawn(move || match stdin.write_all(&bytes) {
                Ok(()) => {}
                // The target closed stdin early; it may already be dead.
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
                Err(err) => debug!(%err, "Writing to target stdin"),
            })
        });

        let (exit_status, timed_out) = wait_with_timeout(&mut child, timeout);
        let wall_time = start.elapsed();

        if let Some(handle) = stdin_writer {
            let _ = handle.join();
        }

        let stderr_tail = stderr_capture
            .and_then(|handle| handle.join().ok())
            .filter(|tail| !tail.is_empty());
        // Stdout is drained to keep the pipe from blocking the child but is
        // not part of the run record.
        if let Some(handle) = stdout_capture {
            let _ = handle.join();
        }

        let map_path = work_dir.path().join(MAP_DUMP_FILE);
        let coverage = match region.dump_to_file(&map_path) {
            Ok(()) => match coverage::parse_map_file(&map_path) {
                Ok(map) => Some(map),
                Err(err) => {
                    debug!(%err, "Parsing coverage map");
                    None
                }
            },
            Err(err) => {
                debug!(%err, "Reading shared memory region");
                None
            }
        };

        let (status, exit_code) = classify(&exit_status, timed_out);

        let artifact_path = if status == RunStatus::Crash {
            save_crash_artifact(work_dir.path(), input)
        } else {
            None
        };

        RunResult {
            status,
            exit_code,
            timed_out,
            wall_time,
            stderr_tail,
            coverage,
            artifact_path,
        }
    }
}

fn classify(
    exit_status: &Option<std::process::ExitStatus>,
    timed_out: bool,
) -> (RunStatus, Option<i32>) {
    if timed_out {
        return (
            RunStatus::Hang,
            exit_status.as_ref().and_then(|status| status.code()),
        );
    }
    match exit_status {
        Some(status) => {
            let code = status.code();
            if status.signal().is_some() || code.is_some_and(|code| code != 0) {
                (RunStatus::Crash, code)
            } else {
                (RunStatus::Ok, code)
            }
        }
        None => (RunStatus::Error, None),
    }
}

/// Waits for the child, killing its process group on timeout: SIGTERM,
/// half a second of grace, then SIGKILL. No wait here is unbounded.
fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
) -> (Option<std::process::ExitStatus>, bool) {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return (Some(status), false),
            Ok(None) => {}
            Err(err) => {
                debug!(%err, "Waiting for target");
                return (None, false);
            }
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(WAIT_POLL);
    }

    let pgid = Pid::from_raw(child.id() as i32);
    signal_group(pgid, Signal::SIGTERM);
    let grace_deadline = Instant::now() + KILL_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return (Some(status), true),
            Ok(None) => {}
            Err(err) => {
                debug!(%err, "Waiting for target after SIGTERM");
                return (None, true);
            }
        }
        if Instant::now() >= grace_deadline {
            break;
        }
        thread::sleep(WAIT_POLL);
    }

    signal_group(pgid, Signal::SIGKILL);
    let status = child.wait().ok();
    (status, true)
}

fn signal_group(pgid: Pid, signal: Signal) {
    match signal::killpg(pgid, signal) {
        // The whole group already exited.
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(%err, %signal, "Signalling target process group"),
    }
}

/// Reads a child stream to EOF, keeping only the trailing bytes.
fn spawn_tail_reader<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut tail = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    tail.extend_from_slice(&chunk[..read]);
                    if tail.len() > STREAM_TAIL_LIMIT {
                        let excess = tail.len() - STREAM_TAIL_LIMIT;
                        tail.drain(..excess);
                    }
                }
            }
        }
        tail
    })
}

fn save_crash_artifact(work_dir: &Path, input: &[u8]) -> Option<PathBuf> {
    let artifact_dir = work_dir.join("artifacts");
    if let Err(err) = fs::create_dir_all(&artifact_dir) {
        warn!(%err, "Creating crash artifact directory");
        return None;
    }
    let path = artifact_dir.join(format!("crash_input_{}.bin", utils::unix_time_millis()));
    match fs::write(&path, input) {
        Ok(()) => Some(path),
        Err(err) => {
            warn!(%err, "Saving crash artifact");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> TargetCommand {
        TargetCommand::new(
            vec!["/bin/sh".into(), "-c".into(), script.into()],
            None,
            4096,
        )
    }

    #[test]
    fn ok_run_is_classified_ok() {
        let mut runner = shell("exit 0");
        let result = runner.run(b"hello", InputMode::Stdin, Duration::from_secs(5));
        assert_eq!(result.status, RunStatus::Ok);
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.timed_out);
        assert!(result.artifact_path.is_none());
    }

    #[test]
    fn nonzero_exit_is_a_crash_with_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = TargetCommand::new(
            vec!["/bin/sh".into(), "-c".into(), "exit 3".into()],
            Some(dir.path().to_path_buf()),
            4096,
        );
        let input = b"crashing input";
        let result = runner.run(input, InputMode::Stdin, Duration::from_secs(5));
        assert_eq!(result.status, RunStatus::Crash);
        assert_eq!(result.exit_code, Some(3));

        let artifact = result.artifact_path.expect("crash artifact saved");
        assert_eq!(fs::read(artifact).unwrap(), input);
    }

    #[test]
    fn timeout_is_classified_hang_without_artifact() {
        let mut runner = shell("sleep 10");
        let started = Instant::now();
        let result = runner.run(b"SLOW", InputMode::Stdin, Duration::from_millis(200));
        assert_eq!(result.status, RunStatus::Hang);
        assert!(result.timed_out);
        assert!(result.artifact_path.is_none());
        // Timeout plus the grace window, with generous slack.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn missing_binary_is_an_error() {
        let mut runner = TargetCommand::new(
            vec!["/nonexistent/edgefuzz-target".into()],
            None,
            4096,
        );
        let result = runner.run(b"", InputMode::Stdin, Duration::from_secs(1));
        assert_eq!(result.status, RunStatus::Error);
        assert!(result.exit_code.is_none());
        assert!(result.stderr_tail.is_some());
    }

    #[test]
    fn file_mode_substitutes_placeholder() {
        let mut runner = TargetCommand::new(
            vec![
                "/bin/sh".into(),
                "-c".into(),
                "grep -q MAGIC \"$0\"".into(),
                INPUT_PLACEHOLDER.into(),
            ],
            None,
            4096,
        );
        let hit = runner.run(b"has MAGIC inside", InputMode::File, Duration::from_secs(5));
        assert_eq!(hit.status, RunStatus::Ok);

        let miss = runner.run(b"nothing here", InputMode::File, Duration::from_secs(5));
        assert_eq!(miss.status, RunStatus::Crash);
    }

    #[test]
    fn file_mode_appends_path_without_placeholder() {
        let mut runner = TargetCommand::new(
            vec!["/bin/sh".into(), "-c".into(), "test -f \"$0\"".into()],
            None,
            4096,
        );
        let result = runner.run(b"payload", InputMode::File, Duration::from_secs(5));
        assert_eq!(result.status, RunStatus::Ok);
    }

    #[test]
    fn stdin_is_delivered_to_the_target() {
        let mut runner = shell("read line; test \"$line\" = ping");
        let result = runner.run(b"ping\n", InputMode::Stdin, Duration::from_secs(5));
        assert_eq!(result.status, RunStatus::Ok);
    }

    #[test]
    fn coverage_dump_is_parsed_from_the_region() {
        // The shell is not instrumented, so the bitmap stays empty but must
        // still parse into an (empty) map.
        let mut runner = shell("exit 0");
        let result = runner.run(b"", InputMode::Stdin, Duration::from_secs(5));
        let coverage = result.coverage.expect("coverage map present");
        assert_eq!(coverage.popcount(), 0);
    }
}

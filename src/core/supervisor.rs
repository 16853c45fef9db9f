//! Process Supervisor.
//!
//! Owns one fuzz process at a time: resolves the corpus set, builds the
//! command (sandboxed or plain), spawns it as a process-group leader with
//! stdout and stderr sharing one pipe, and multiplexes that output with the
//! run deadline and the cancellation token. Every resource the run creates
//! is recorded in [`RunResources`] and released exactly once when `run`
//! returns, whatever the path out.

use crate::config::types::{Binding, FuzzError, Result, RunConfiguration};
use crate::core::args::{build_invocation, fuzzer_env};
use crate::core::cancel::CancelToken;
use crate::core::types::{RunMetrics, Termination};
use crate::finding::parser::{FindingParser, ParseEvent};
use crate::finding::signature::identity;
use crate::finding::types::{Finding, FindingKind};
use crate::kernel::process::{terminate_process_group, TERMINATION_GRACE};
use crate::report::handler::ReportHandler;
use crate::safety::cleanup::RunResources;
use crate::safety::lock::CorpusLock;
use crate::sandbox::finder::{Tool, ToolFinder};
use crate::sandbox::policy::{SandboxPolicyBuilder, SandboxRequest};
use crate::utils::env;
use crate::utils::output::{spawn_reader, OutputChunk};
use crate::utils::seeds::count_seeds;
use chrono::Utc;
use crossbeam_channel::{select, Receiver};
use log::{debug, info, warn};
use nix::fcntl::OFlag;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll interval while waiting for a process whose output already closed
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Lock files and sandbox roots live here
    pub scratch_root: PathBuf,
    /// Time between SIGTERM and SIGKILL when stopping the process group
    pub termination_grace: Duration,
    /// How long to keep reading output after the process group was stopped
    pub drain_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            scratch_root: default_scratch_root(),
            termination_grace: TERMINATION_GRACE,
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// `$TMPDIR/fuzzbox-uid-<euid>`
pub fn default_scratch_root() -> PathBuf {
    std::env::temp_dir().join(format!("fuzzbox-uid-{}", nix::unistd::geteuid()))
}

/// Why the output loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// Every write end of the output pipe closed
    Eof,
    Deadline,
    Cancelled,
}

/// Routes parser events to the report and the metrics, in arrival order.
struct EventSink<'a> {
    report: &'a mut ReportHandler,
    metrics: &'a mut RunMetrics,
    /// Timeout findings seen since the run deadline fired
    timeouts_after_deadline: usize,
    deadline_passed: bool,
}

impl EventSink<'_> {
    fn handle(&mut self, events: Vec<ParseEvent>) -> Result<()> {
        for event in events {
            match event {
                ParseEvent::Finding(finding) => {
                    if self.deadline_passed && finding.kind == FindingKind::Timeout {
                        self.timeouts_after_deadline += 1;
                    }
                    self.report.add_finding(finding)?;
                }
                ParseEvent::Stats(stats) => self.metrics.update_stats(&stats),
                ParseEvent::Passthrough(line) => self.report.passthrough(&line)?,
            }
        }
        Ok(())
    }
}

pub struct Supervisor {
    options: SupervisorOptions,
    sandbox: Option<Box<dyn SandboxPolicyBuilder>>,
    finder: Arc<dyn ToolFinder>,
}

impl Supervisor {
    pub fn new(
        options: SupervisorOptions,
        sandbox: Option<Box<dyn SandboxPolicyBuilder>>,
        finder: Arc<dyn ToolFinder>,
    ) -> Self {
        Self {
            options,
            sandbox,
            finder,
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Run the fuzz target described by `config` until it exits, the
    /// configured timeout expires, or `token` is triggered.
    ///
    /// Findings go to `report` as they are recognized. Returns the run's
    /// metrics on a clean exit, a timeout, or an exit explained by findings.
    /// Cancellation by a signal yields [`FuzzError::Interrupted`]; a failing
    /// exit with nothing recognized yields [`FuzzError::UnrecognizedFailure`].
    pub fn run(
        &mut self,
        token: &CancelToken,
        config: &RunConfiguration,
        report: &mut ReportHandler,
    ) -> Result<RunMetrics> {
        let mut resources = RunResources::new(token.clone());
        let result = self.run_inner(token, config, report, &mut resources);
        resources.cleanup();
        result
    }

    fn run_inner(
        &self,
        token: &CancelToken,
        config: &RunConfiguration,
        report: &mut ReportHandler,
        resources: &mut RunResources,
    ) -> Result<RunMetrics> {
        let started = Instant::now();

        let sandbox = match (config.use_sandbox, self.sandbox.as_deref()) {
            (true, Some(builder)) => Some(builder),
            (true, None) => {
                return Err(FuzzError::SandboxConstruction(
                    "sandboxing was requested but no sandbox builder is configured".to_string(),
                ))
            }
            (false, _) => None,
        };

        let executable = canonical(&config.executable, "fuzz target")?;
        fs::create_dir_all(&config.primary_seed_dir)?;
        let mut seed_dirs = Vec::with_capacity(1 + config.additional_seed_dirs.len());
        for dir in config.seed_dirs() {
            let dir = canonical(&dir, "seed directory")?;
            if seed_dirs.contains(&dir) {
                debug!("Seed directory {} listed twice; using it once", dir.display());
                continue;
            }
            seed_dirs.push(dir);
        }

        let lock = CorpusLock::acquire(&self.options.scratch_root, &seed_dirs[0])?;
        resources.record_lock(lock);

        if let Some(dir) = &config.artifact_dir {
            fs::create_dir_all(dir)?;
        }

        let seeds_before = count_seeds(&seed_dirs)?;
        debug!("Corpus holds {} seed(s) before the run", seeds_before);

        let cwd = std::env::current_dir()?;
        let invocation = build_invocation(config, &executable, &seed_dirs, &cwd);
        let symbolizer = match self.finder.find(Tool::LlvmSymbolizer) {
            Ok(path) => Some(path),
            Err(e) => {
                debug!("Running without symbolizer: {}", e);
                None
            }
        };
        let fuzz_env = fuzzer_env(config, &env::current(), symbolizer.as_deref());

        let mut command = match sandbox {
            Some(builder) => {
                let mut bindings = invocation.bindings.clone();
                if let Some(path) = &symbolizer {
                    bindings.push(Binding::read_only(path));
                }
                let root = self
                    .options
                    .scratch_root
                    .join(format!("run-{}", uuid::Uuid::new_v4()));
                fs::create_dir_all(&root)?;
                resources.record_scratch_dir(root.clone());

                let sandboxed = builder.build(&SandboxRequest {
                    command: &invocation.args,
                    bindings: &bindings,
                    env: &fuzz_env,
                    root_dir: &root,
                })?;
                sandboxed.prepare(&root)?;
                debug!("Sandboxed command ({}): {:?}", builder.name(), sandboxed.args);

                let mut cmd = Command::new(sandboxed.program());
                cmd.args(&sandboxed.args[1..]);
                cmd
            }
            None => {
                let mut cmd = Command::new(&invocation.args[0]);
                cmd.args(&invocation.args[1..]).envs(env::pairs(&fuzz_env));
                cmd
            }
        };
        let program = command.get_program().to_string_lossy().into_owned();

        if token.is_triggered() {
            return Err(interrupted(token));
        }

        let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| FuzzError::Io(std::io::Error::from(e)))?;
        let stderr_end = write_end.try_clone()?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(stderr_end))
            .process_group(0);

        info!("Starting {} ({} seed(s))", config.target_name(), seeds_before);
        debug!("Command: {:?}", invocation.args);
        let child = command
            .spawn()
            .map_err(|source| FuzzError::Spawn { program, source })?;
        // Our copies of the write end must close so the reader sees EOF.
        drop(command);
        resources.record_child(child);

        let (output, reader) = spawn_reader(File::from(read_end))?;

        let deadline = deadline_after(Instant::now(), config.timeout());
        let timer = match deadline {
            Some(at) => crossbeam_channel::at(at),
            None => crossbeam_channel::never(),
        };

        let mut parser = FindingParser::new();
        let mut metrics = RunMetrics {
            seeds_before,
            ..Default::default()
        };
        let mut sink = EventSink {
            report,
            metrics: &mut metrics,
            timeouts_after_deadline: 0,
            deadline_passed: false,
        };

        let stop = loop {
            select! {
                recv(output) -> chunk => match chunk {
                    Ok(OutputChunk::Data(bytes)) => sink.handle(parser.feed(&bytes))?,
                    Ok(OutputChunk::Error(e)) => {
                        warn!("Reading fuzzer output failed: {}", e);
                        break Stop::Eof;
                    }
                    Ok(OutputChunk::Eof) | Err(_) => break Stop::Eof,
                },
                recv(token.done()) -> _ => break Stop::Cancelled,
                recv(timer) -> _ => break Stop::Deadline,
            }
        };

        let child = resources
            .child_mut()
            .ok_or_else(|| FuzzError::Io(std::io::Error::other("fuzz process handle lost")))?;

        let termination = match stop {
            Stop::Eof => {
                reader.join();
                sink.handle(parser.finish())?;
                match wait_for_exit(child, token, deadline)? {
                    Some(status) => termination_of(status),
                    None => {
                        self.stop_group(child);
                        if token.is_triggered() {
                            Termination::Cancelled
                        } else {
                            Termination::TimedOut
                        }
                    }
                }
            }
            Stop::Deadline => {
                info!("Run timeout reached, stopping {}", config.target_name());
                sink.deadline_passed = true;
                self.stop_group(child);
                self.drain(&output, &mut parser, &mut sink)?;
                reader.stop();
                Termination::TimedOut
            }
            Stop::Cancelled => {
                debug!("Run cancelled, stopping {}", config.target_name());
                self.stop_group(child);
                self.drain(&output, &mut parser, &mut sink)?;
                reader.stop();
                Termination::Cancelled
            }
        };

        if termination == Termination::TimedOut && sink.timeouts_after_deadline == 0 {
            let timeout = synthesized_timeout(config, timeout_identity(&parser, config));
            sink.report.add_finding(timeout)?;
        }

        let findings = sink.report.finding_count();
        let occurrences = sink.report.occurrences();
        metrics.findings = findings;
        metrics.finding_occurrences = occurrences;
        metrics.seeds_after = count_seeds(&seed_dirs)?;
        metrics.elapsed = started.elapsed();
        metrics.termination = Some(termination.clone());
        debug!(
            "Run ended: target {}, {} finding(s), {} new seed(s)",
            termination.describe(),
            metrics.findings,
            metrics.new_seeds()
        );

        match termination {
            Termination::Cancelled => match token.signal() {
                Some(_) => Err(interrupted(token)),
                None => Ok(metrics),
            },
            Termination::TimedOut => Ok(metrics),
            Termination::Exited { code: 0 } => Ok(metrics),
            other if metrics.finding_occurrences > 0 => {
                debug!("Target {}; explained by reported findings", other.describe());
                Ok(metrics)
            }
            other => Err(FuzzError::UnrecognizedFailure {
                status: other.describe(),
                sandboxed: config.use_sandbox,
            }),
        }
    }

    fn stop_group(&self, child: &mut Child) {
        let report = terminate_process_group(child, self.options.termination_grace);
        debug!("Stopped process group {}: {:?}", child.id(), report);
    }

    /// Read what the stopped process group still wrote, bounded by
    /// `drain_timeout`, then flush the parser.
    fn drain(
        &self,
        output: &Receiver<OutputChunk>,
        parser: &mut FindingParser,
        sink: &mut EventSink<'_>,
    ) -> Result<()> {
        let until = Instant::now() + self.options.drain_timeout;
        loop {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Output still open after the process group was stopped; giving up on it");
                break;
            }
            select! {
                recv(output) -> chunk => match chunk {
                    Ok(OutputChunk::Data(bytes)) => sink.handle(parser.feed(&bytes))?,
                    _ => break,
                },
                default(remaining) => {}
            }
        }
        sink.handle(parser.finish())
    }
}

/// Run deadline for `timeout` counted from `start`. A timeout too large to
/// represent is treated as no timeout.
fn deadline_after(start: Instant, timeout: Option<Duration>) -> Option<Instant> {
    let timeout = timeout?;
    let deadline = start.checked_add(timeout);
    if deadline.is_none() {
        warn!(
            "Run timeout of {} is out of range; running without a timeout",
            crate::utils::duration::format_duration(timeout)
        );
    }
    deadline
}

/// Wait for a process whose output already closed. `None` when the token
/// fired or the deadline passed first.
fn wait_for_exit(
    child: &mut Child,
    token: &CancelToken,
    deadline: Option<Instant>,
) -> Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if token.is_triggered() || deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(None);
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }
}

fn termination_of(status: ExitStatus) -> Termination {
    match (status.code(), status.signal()) {
        (Some(code), _) => Termination::Exited { code },
        (None, Some(signal)) => Termination::Signaled { signal },
        (None, None) => Termination::Exited { code: -1 },
    }
}

fn interrupted(token: &CancelToken) -> FuzzError {
    FuzzError::Interrupted {
        signal: token.signal().unwrap_or(libc::SIGTERM),
    }
}

fn canonical(path: &Path, what: &str) -> Result<PathBuf> {
    path.canonicalize().map_err(|e| match e.kind() {
        ErrorKind::NotFound => {
            FuzzError::Config(format!("{} {} does not exist", what, path.display()))
        }
        _ => FuzzError::Config(format!("cannot resolve {} {}: {}", what, path.display(), e)),
    })
}

fn timeout_identity(parser: &FindingParser, config: &RunConfiguration) -> String {
    identity(
        FindingKind::Timeout,
        &timeout_details(config),
        &[],
        parser.normalizer(),
    )
}

fn timeout_details(config: &RunConfiguration) -> String {
    match config.timeout() {
        Some(t) => format!(
            "run timeout of {} reached",
            crate::utils::duration::format_duration(t)
        ),
        None => "run timeout reached".to_string(),
    }
}

fn synthesized_timeout(config: &RunConfiguration, identity: String) -> Finding {
    Finding {
        kind: FindingKind::Timeout,
        details: timeout_details(config),
        source_location: None,
        input_file: None,
        identity,
        input_data_available: false,
        stack_trace: Vec::new(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::OutputFormat;
    use crate::core::cancel::CancelState;
    use std::os::unix::fs::PermissionsExt;

    struct NoTools;

    impl ToolFinder for NoTools {
        fn find(&self, tool: Tool) -> Result<PathBuf> {
            Err(FuzzError::Config(format!("{} not installed", tool.binary_name())))
        }
    }

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fuzz_target");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervisor(scratch: &Path) -> Supervisor {
        Supervisor::new(
            SupervisorOptions {
                scratch_root: scratch.to_path_buf(),
                termination_grace: Duration::from_millis(100),
                drain_timeout: Duration::from_millis(500),
            },
            None,
            Arc::new(NoTools),
        )
    }

    fn quiet_report() -> ReportHandler {
        ReportHandler::with_writers(
            OutputFormat::Json,
            false,
            Box::new(std::io::sink()),
            Box::new(std::io::sink()),
        )
    }

    #[test]
    fn clean_exit_creates_primary_corpus() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "echo hello; exit 0");
        let corpus = tmp.path().join("corpus");
        let config = RunConfiguration::new(&exe, &corpus);
        let token = CancelToken::new();
        let mut report = quiet_report();

        let metrics = supervisor(&tmp.path().join("scratch"))
            .run(&token, &config, &mut report)
            .unwrap();

        assert!(corpus.is_dir());
        assert_eq!(metrics.findings, 0);
        assert_eq!(metrics.termination, Some(Termination::Exited { code: 0 }));
        assert_eq!(token.state(), CancelState::Cleaned);
    }

    #[test]
    fn sandbox_without_builder_never_spawns() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("ran");
        let exe = script(tmp.path(), &format!("touch {}", marker.display()));
        let mut config = RunConfiguration::new(&exe, tmp.path().join("corpus"));
        config.use_sandbox = true;

        let err = supervisor(&tmp.path().join("scratch"))
            .run(&CancelToken::new(), &config, &mut quiet_report())
            .unwrap_err();
        assert!(matches!(err, FuzzError::SandboxConstruction(_)), "got {err:?}");
        assert!(!marker.exists());
    }

    #[test]
    fn missing_executable_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = RunConfiguration::new(tmp.path().join("nope"), tmp.path().join("corpus"));
        let err = supervisor(&tmp.path().join("scratch"))
            .run(&CancelToken::new(), &config, &mut quiet_report())
            .unwrap_err();
        assert!(matches!(err, FuzzError::Config(_)), "got {err:?}");
    }

    #[test]
    fn signal_exit_without_output_is_unrecognized() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "kill -SEGV $$");
        let config = RunConfiguration::new(&exe, tmp.path().join("corpus"));
        let err = supervisor(&tmp.path().join("scratch"))
            .run(&CancelToken::new(), &config, &mut quiet_report())
            .unwrap_err();
        match err {
            FuzzError::UnrecognizedFailure { status, sandboxed } => {
                assert!(status.contains("signal"), "{status}");
                assert!(!sandboxed);
            }
            other => panic!("expected UnrecognizedFailure, got {other:?}"),
        }
    }

    #[test]
    fn oversized_timeout_runs_unbounded() {
        let huge = crate::utils::duration::parse_duration("99999999999999999h").unwrap();
        assert_eq!(deadline_after(Instant::now(), Some(huge)), None);
        assert_eq!(deadline_after(Instant::now(), None), None);
        let start = Instant::now();
        assert_eq!(
            deadline_after(start, Some(Duration::from_secs(5))),
            Some(start + Duration::from_secs(5))
        );

        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "exit 0");
        let mut config = RunConfiguration::new(&exe, tmp.path().join("corpus"));
        config.timeout = huge;
        let metrics = supervisor(&tmp.path().join("scratch"))
            .run(&CancelToken::new(), &config, &mut quiet_report())
            .unwrap();
        assert_eq!(metrics.termination, Some(Termination::Exited { code: 0 }));
        assert_eq!(metrics.findings, 0);
    }

    #[test]
    fn seed_dir_listed_twice_is_counted_once() {
        let tmp = tempfile::tempdir().unwrap();
        let corpus = tmp.path().join("corpus");
        fs::create_dir(&corpus).unwrap();
        fs::write(corpus.join("a"), b"1").unwrap();
        fs::write(corpus.join("b"), b"2").unwrap();
        let exe = script(tmp.path(), "exit 0");
        let mut config = RunConfiguration::new(&exe, &corpus);
        config.additional_seed_dirs = vec![corpus.join(".")];

        let metrics = supervisor(&tmp.path().join("scratch"))
            .run(&CancelToken::new(), &config, &mut quiet_report())
            .unwrap();
        assert_eq!(metrics.seeds_before, 2);
        assert_eq!(metrics.seeds_after, 2);
    }

    #[test]
    fn timeout_details_mention_limit() {
        let mut config = RunConfiguration::new("/t", "/c");
        config.timeout = Duration::from_secs(90);
        assert_eq!(timeout_details(&config), "run timeout of 1m30s reached");
    }
}

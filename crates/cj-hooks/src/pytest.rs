use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cj_core::types::{HookResult, HookStatus, TestCounts, TestFailure, TestResult};
use cj_guard::subprocess::{CommandSpec, SubprocessError, SubprocessExecutor};
use regex::Regex;
use std::sync::OnceLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::parse::strip_ansi;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TestOptions {
    /// Worker count; 0 selects auto (logical cores, capped).
    pub workers: usize,
    pub coverage: bool,
    /// Benchmark mode serializes the whole suite.
    pub benchmark: bool,
    pub timeout: Duration,
    pub stuck_threshold: Duration,
    /// `-k` expression restricting the run.
    pub pattern: Option<String>,
    pub path: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            coverage: true,
            benchmark: false,
            timeout: Duration::from_secs(600),
            stuck_threshold: Duration::from_secs(60),
            pattern: None,
            path: None,
            verbose: false,
        }
    }
}

impl TestOptions {
    fn effective_workers(&self) -> usize {
        if self.benchmark {
            return 1;
        }
        if self.workers > 0 {
            return self.workers;
        }
        num_cpus::get().min(8)
    }
}

/// The pytest argv for a set of options. Pure, so the command line is
/// testable without spawning anything.
pub fn build_args(options: &TestOptions) -> Vec<String> {
    let mut args: Vec<String> = vec!["-v".into(), "--tb=short".into(), "-rf".into()];

    let workers = options.effective_workers();
    if workers > 1 {
        args.push("-n".into());
        args.push(workers.to_string());
    }
    if options.benchmark {
        args.push("--benchmark-only".into());
    }
    if options.coverage {
        args.push("--cov=.".into());
        args.push("--cov-report=term".into());
    }
    if let Some(pattern) = &options.pattern {
        args.push("-k".into());
        args.push(pattern.clone());
    }
    if options.verbose {
        args.push("-rA".into());
    }
    if let Some(path) = &options.path {
        args.push(path.display().to_string());
    }
    args
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed,
    Skipped,
    Errored,
}

/// Progress events, emitted in arrival order (the stream merge preserves
/// monotonic sequence numbers).
#[derive(Debug, Clone)]
pub enum TestEvent {
    CollectionComplete { total: u32 },
    TestFinished { test_id: String, outcome: TestOutcome },
    TestStuck { test_id: String, elapsed: Duration },
    Coverage { percent: f64 },
    SessionFinished { counts: TestCounts },
    Output { line: String },
}

// ---------------------------------------------------------------------------
// Line patterns
// ---------------------------------------------------------------------------

fn collected_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"collected (\d+) items?").expect("collected pattern"))
}

fn outcome_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<id>\S+::\S+)\s+(?P<outcome>PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)")
            .expect("outcome pattern")
    })
}

fn summary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+) (passed|failed|skipped|errors?|xfailed|xpassed)").expect("summary")
    })
}

fn failed_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:FAILED|ERROR)\s+(?P<id>\S+?)(?:\s+-\s+(?P<msg>.*))?$").expect("failed")
    })
}

fn coverage_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"TOTAL\s+\d+\s+\d+\s+(?P<pct>\d+(?:\.\d+)?)%").expect("coverage")
    })
}

// ---------------------------------------------------------------------------
// TestExecutor
// ---------------------------------------------------------------------------

/// Runs the project test suite as a specialized hook, streaming progress and
/// extracting counts, failures, and the coverage summary.
pub struct TestExecutor {
    root: PathBuf,
    executor: Arc<SubprocessExecutor>,
    runner: String,
    cancel: Option<tokio::sync::watch::Receiver<bool>>,
}

impl TestExecutor {
    pub fn new(root: impl Into<PathBuf>, executor: Arc<SubprocessExecutor>) -> Self {
        Self {
            root: root.into(),
            executor,
            runner: "pytest".into(),
            cancel: None,
        }
    }

    /// Override the runner binary (tests use a shell stub).
    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        self.runner = runner.into();
        self
    }

    /// Attach a cancellation signal; a set flag SIGTERMs the runner's
    /// process group mid-session.
    pub fn with_cancel(mut self, cancel: tokio::sync::watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn run(
        &self,
        options: &TestOptions,
        events: Option<flume::Sender<TestEvent>>,
    ) -> TestResult {
        let started = Instant::now();
        let spec = CommandSpec::new(&self.runner, &self.root)
            .args(build_args(options))
            .timeout(options.timeout);

        info!(runner = %self.runner, timeout_secs = options.timeout.as_secs(), "running test suite");

        let stream = match self.executor.spawn_lines(spec).await {
            Ok(stream) => stream,
            Err(SubprocessError::NotFound(program)) => {
                warn!(program, "test runner not found");
                return error_result(
                    started,
                    String::new(),
                    format!("test runner `{program}` not found"),
                );
            }
            Err(e) => {
                return error_result(started, String::new(), e.to_string());
            }
        };

        let lines = stream.lines.clone();
        let mut session = ParseSession::default();

        // Single display string for racing UI writers.
        let current_test: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));

        // Stuck monitor: flags, never kills.
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let monitor = {
            let current_test = Arc::clone(&current_test);
            let last_activity = Arc::clone(&last_activity);
            let events = events.clone();
            let threshold = options.stuck_threshold;
            tokio::spawn(async move {
                let mut flagged = false;
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    ticker.tick().await;
                    let idle = last_activity.lock().await.elapsed();
                    if idle > threshold && !flagged {
                        flagged = true;
                        let test_id = current_test.lock().await.clone();
                        let test_id = if test_id.is_empty() {
                            "<collecting>".to_string()
                        } else {
                            test_id
                        };
                        warn!(test = %test_id, idle_secs = idle.as_secs(), "test appears stuck");
                        if let Some(events) = &events {
                            let _ = events.try_send(TestEvent::TestStuck {
                                test_id,
                                elapsed: idle,
                            });
                        }
                    } else if idle <= threshold {
                        flagged = false;
                    }
                }
            })
        };

        // Consume merged output while the child runs.
        let consumer = {
            let current_test = Arc::clone(&current_test);
            let last_activity = Arc::clone(&last_activity);
            let events = events.clone();
            async move {
                while let Ok(line) = lines.recv_async().await {
                    *last_activity.lock().await = Instant::now();
                    let text = strip_ansi(&line.text);
                    session.feed(&text, &events);
                    if let Some(test_id) = session.last_finished.as_ref() {
                        *current_test.lock().await = test_id.clone();
                    }
                }
                session
            }
        };

        let cancel = self.cancel.clone();
        let (session, exit_code) = tokio::join!(consumer, async {
            stream.wait_or_cancel(options.timeout, cancel).await
        });
        monitor.abort();

        let mut session = session;
        let duration_ms = started.elapsed().as_millis() as u64;
        let timed_out = exit_code.is_none() && started.elapsed() >= options.timeout;

        if timed_out {
            warn!("test session timed out, process group killed");
        }

        session.finalize(&events);
        let counts = session.counts;
        let status = if timed_out {
            HookStatus::Error
        } else if exit_code == Some(0) {
            HookStatus::Passed
        } else if counts.failed > 0 || counts.errors > 0 {
            HookStatus::Failed
        } else {
            // Runner crash with no reported failures.
            HookStatus::Error
        };

        debug!(
            passed = counts.passed,
            failed = counts.failed,
            skipped = counts.skipped,
            errors = counts.errors,
            coverage = ?session.coverage,
            "test session finished"
        );

        TestResult {
            hook: HookResult {
                hook_id: "pytest".into(),
                status,
                duration_ms,
                stdout: session.raw.join("\n"),
                stderr: String::new(),
                exit_code,
                issues: Vec::new(),
                cache_key: None,
            },
            counts,
            coverage_percent: session.coverage,
            failures: session.failures,
        }
    }
}

fn error_result(started: Instant, stdout: String, stderr: String) -> TestResult {
    TestResult {
        hook: HookResult {
            hook_id: "pytest".into(),
            status: HookStatus::Error,
            duration_ms: started.elapsed().as_millis() as u64,
            stdout,
            stderr,
            exit_code: None,
            issues: Vec::new(),
            cache_key: None,
        },
        counts: TestCounts::default(),
        coverage_percent: None,
        failures: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Stream parsing
// ---------------------------------------------------------------------------

/// Accumulates parse state over the merged line stream. Unrecognized lines
/// are kept as context for failure traces.
#[derive(Default)]
struct ParseSession {
    counts: TestCounts,
    counts_from_summary: bool,
    coverage: Option<f64>,
    failures: Vec<TestFailure>,
    last_finished: Option<String>,
    /// Context lines since the last recognized event; becomes the traceback
    /// for the next reported failure.
    context: Vec<String>,
    raw: Vec<String>,
    /// Per-test tallies observed live (pre-summary).
    live: TestCounts,
}

impl ParseSession {
    fn feed(&mut self, line: &str, events: &Option<flume::Sender<TestEvent>>) {
        if self.raw.len() < 100_000 {
            self.raw.push(line.to_string());
        }
        let trimmed = line.trim();

        if let Some(captures) = collected_re().captures(trimmed) {
            let total: u32 = captures[1].parse().unwrap_or(0);
            emit(events, TestEvent::CollectionComplete { total });
            return;
        }

        if let Some(captures) = outcome_re().captures(trimmed) {
            let test_id = captures["id"].to_string();
            let outcome = match &captures["outcome"] {
                "PASSED" | "XPASS" => {
                    self.live.passed += 1;
                    TestOutcome::Passed
                }
                "FAILED" => {
                    self.live.failed += 1;
                    TestOutcome::Failed
                }
                "ERROR" => {
                    self.live.errors += 1;
                    TestOutcome::Errored
                }
                _ => {
                    self.live.skipped += 1;
                    TestOutcome::Skipped
                }
            };
            self.last_finished = Some(test_id.clone());
            self.context.clear();
            emit(events, TestEvent::TestFinished { test_id, outcome });
            return;
        }

        if let Some(captures) = failed_line_re().captures(trimmed) {
            let test_id = captures["id"].to_string();
            let message = captures
                .name("msg")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            // Short-summary lines repeat per-test results; keep one record
            // per test id.
            if !self.failures.iter().any(|f| f.test_id == test_id) {
                self.failures.push(TestFailure {
                    test_id,
                    message,
                    traceback: self.context.join("\n"),
                    stuck: false,
                });
            }
            return;
        }

        if let Some(captures) = coverage_re().captures(trimmed) {
            if let Ok(percent) = captures["pct"].parse::<f64>() {
                self.coverage = Some(percent);
                emit(events, TestEvent::Coverage { percent });
            }
            return;
        }

        if trimmed.contains(" in ") && summary_re().is_match(trimmed) && trimmed.starts_with('=') {
            let mut counts = TestCounts::default();
            for captures in summary_re().captures_iter(trimmed) {
                let n: u32 = captures[1].parse().unwrap_or(0);
                match &captures[2] {
                    "passed" => counts.passed = n,
                    "failed" => counts.failed = n,
                    "skipped" => counts.skipped = n,
                    "error" | "errors" => counts.errors = n,
                    _ => {}
                }
            }
            self.counts = counts;
            self.counts_from_summary = true;
            return;
        }

        // Unrecognized: context for failure traces, forwarded as output.
        if !trimmed.is_empty() {
            self.context.push(line.to_string());
            if self.context.len() > 200 {
                self.context.remove(0);
            }
            emit(
                events,
                TestEvent::Output {
                    line: line.to_string(),
                },
            );
        }
    }

    fn finalize(&mut self, events: &Option<flume::Sender<TestEvent>>) {
        // A crashed runner never prints the summary; fall back to live
        // tallies so tests that reported before the crash are counted.
        if !self.counts_from_summary {
            self.counts = self.live;
        }
        emit(
            events,
            TestEvent::SessionFinished {
                counts: self.counts,
            },
        );
    }
}

fn emit(events: &Option<flume::Sender<TestEvent>>, event: TestEvent) {
    if let Some(events) = events {
        let _ = events.try_send(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

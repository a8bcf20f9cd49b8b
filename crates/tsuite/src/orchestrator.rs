//! The run orchestrator: discovers and filters tests, schedules them over
//! a fixed worker pool, observes cancellation, and reports everything to
//! the control service.
//!
//! Workers consume test ids from an ordered channel; reductions happen as
//! the result channel drains. Beyond "started in submission order until
//! the pool saturates" there is no cross-test ordering guarantee.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use engine::contracts::{CreateRunRequest, ScheduledTest, TestPatch};
use engine::discovery::{discover_filtered, DiscoveredTest, TestFilter};
use engine::paths::StateDirs;
use engine::sandbox::{strategy_for, ExecContext, ExecReport, ExecStrategy};
use engine::store::TestStatus;
use engine::{ControlClient, SuiteConfig};

/// Poll cadence for the cancellation watcher.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Options for one orchestrated run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub suite_path: PathBuf,
    pub api_url: String,
    pub filter: TestFilter,
    /// Overrides `execution.max_workers` when set
    pub parallel: Option<usize>,
    pub display_name: Option<String>,
    pub runner_path: Option<PathBuf>,
    pub state_dirs: StateDirs,
}

/// Final tallies of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

/// Execute a full run against the given control service.
pub async fn execute(options: RunOptions) -> Result<RunSummary> {
    let suite_path = options
        .suite_path
        .canonicalize()
        .with_context(|| format!("suite path {}", options.suite_path.display()))?;
    let config = SuiteConfig::load(&suite_path)?;
    let tests = discover_filtered(&suite_path, &options.filter);
    anyhow::ensure!(!tests.is_empty(), "no tests match the given filters");

    let run_id = uuid::Uuid::new_v4().to_string();
    let display_name = options
        .display_name
        .clone()
        .unwrap_or_else(|| format!("{} @ {}", config.suite.name, Utc::now().format("%Y-%m-%d %H:%M:%S")));
    let client = ControlClient::new(options.api_url.clone());

    // Register the run and one pending row per scheduled test.
    let request = CreateRunRequest {
        run_id: run_id.clone(),
        suite_id: None,
        display_name,
        mode: config.suite.mode.clone(),
        version: engine::VERSION.to_string(),
        tests: tests
            .iter()
            .map(|t| ScheduledTest {
                test_id: t.test_id.clone(),
                use_case: t.use_case.clone(),
                test_case: t.test_case.clone(),
                name: t.name.clone(),
                tags: t.tags.clone(),
            })
            .collect(),
    };
    client.create_run(&request).await.context("registering run")?;

    let max_workers = options
        .parallel
        .unwrap_or(config.execution.max_workers)
        .max(1);
    info!(run_id, total = tests.len(), max_workers, mode = %config.suite.mode, "run starting");

    let scratch = tempfile::Builder::new()
        .prefix("tsuite-")
        .tempdir()
        .context("creating scratch base")?;
    let runner_binary = match &options.runner_path {
        Some(path) => path.clone(),
        None => default_runner_binary()?,
    };

    let cancel = CancellationToken::new();
    let exec_ctx = ExecContext {
        suite_path: suite_path.clone(),
        config: config.clone(),
        scratch_base: scratch.path().to_path_buf(),
        runner_binary,
        server_url: options.api_url.clone(),
        run_id: run_id.clone(),
        cancel: cancel.clone(),
    };
    let strategy: Arc<dyn ExecStrategy> = Arc::from(strategy_for(&config));

    // Watcher: poll the service for cancel_requested at a 1s cadence and
    // trip the token when it appears.
    let watcher_shutdown = CancellationToken::new();
    let watcher = {
        let client = client.clone();
        let run_id = run_id.clone();
        let cancel = cancel.clone();
        let shutdown = watcher_shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {}
                }
                match client.get_run(&run_id).await {
                    Ok(run) if run.cancel_requested => {
                        warn!(run_id, "cancellation requested, stopping workers");
                        cancel.cancel();
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => debug!(run_id, error = %e, "cancel poll failed"),
                }
            }
        })
    };

    // Ordered input channel, closed once everything is enqueued.
    let (test_tx, test_rx) = mpsc::channel::<DiscoveredTest>(tests.len());
    let (result_tx, mut result_rx) = mpsc::channel::<TestStatus>(tests.len());
    for test in &tests {
        test_tx.send(test.clone()).await.expect("channel sized to fit");
    }
    drop(test_tx);

    let test_rx = Arc::new(Mutex::new(test_rx));
    let mut workers = Vec::with_capacity(max_workers);
    for worker_id in 0..max_workers {
        let test_rx = Arc::clone(&test_rx);
        let result_tx = result_tx.clone();
        let client = client.clone();
        let strategy = Arc::clone(&strategy);
        let exec_ctx = exec_ctx.clone();
        let run_id = run_id.clone();
        let dirs = options.state_dirs.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let test = {
                    let mut rx = test_rx.lock().await;
                    rx.recv().await
                };
                let Some(test) = test else { break };
                let status =
                    run_one(worker_id, &test, &client, strategy.as_ref(), &exec_ctx, &run_id, &dirs)
                        .await;
                let _ = result_tx.send(status).await;
            }
        }));
    }
    drop(result_tx);

    // Reductions while the result channel drains.
    let (mut passed, mut failed, mut skipped) = (0usize, 0usize, 0usize);
    while let Some(status) = result_rx.recv().await {
        match status {
            TestStatus::Passed => passed += 1,
            TestStatus::Skipped => skipped += 1,
            _ => failed += 1,
        }
    }
    for worker in workers {
        let _ = worker.await;
    }
    watcher_shutdown.cancel();
    let _ = watcher.await;

    // Drive the run row to a terminal status.
    let cancelled = cancel.is_cancelled();
    if cancelled {
        let _ = client.cancel_run(&run_id).await;
    } else {
        client.complete_run(&run_id).await.context("completing run")?;
    }

    info!(run_id, passed, failed, skipped, cancelled, "run finished");
    Ok(RunSummary {
        run_id,
        total: tests.len(),
        passed,
        failed,
        skipped,
        cancelled,
    })
}

/// Run one test through the isolation strategy, reporting transitions.
async fn run_one(
    worker_id: usize,
    test: &DiscoveredTest,
    client: &ControlClient,
    strategy: &dyn ExecStrategy,
    exec_ctx: &ExecContext,
    run_id: &str,
    dirs: &StateDirs,
) -> TestStatus {
    // Cancellation observed before starting: skip without executing.
    if exec_ctx.cancel.is_cancelled() {
        let patch = TestPatch {
            status: Some(TestStatus::Skipped),
            finished_at: Some(Utc::now().timestamp_millis()),
            error_message: Some("Run cancelled".to_string()),
            ..Default::default()
        };
        client.patch_test_best_effort(run_id, &test.test_id, &patch).await;
        return TestStatus::Skipped;
    }

    debug!(worker_id, test_id = %test.test_id, "worker picked up test");
    client
        .patch_test_best_effort(
            run_id,
            &test.test_id,
            &TestPatch::running(Utc::now().timestamp_millis()),
        )
        .await;

    let report = strategy.execute(exec_ctx, &test.test_id).await;
    persist_logs(dirs, run_id, test, &report);

    let now = Utc::now().timestamp_millis();
    let (status, patch) = interpret(&report, now);
    if let Err(e) = client.patch_test(run_id, &test.test_id, &patch).await {
        error!(test_id = %test.test_id, error = %e, "failed to report final status");
    }
    debug!(worker_id, test_id = %test.test_id, status = status.as_str(), "test done");
    status
}

/// Map an execution report onto a terminal status and its patch.
fn interpret(report: &ExecReport, now_ms: i64) -> (TestStatus, TestPatch) {
    if report.cancelled {
        let patch = TestPatch {
            status: Some(TestStatus::Skipped),
            finished_at: Some(now_ms),
            duration_ms: Some(report.duration_ms),
            error_message: Some("Run cancelled".to_string()),
            ..Default::default()
        };
        return (TestStatus::Skipped, patch);
    }

    match report.parse_outcome() {
        Some(outcome) => {
            let status = if outcome.passed {
                TestStatus::Passed
            } else {
                TestStatus::Failed
            };
            (status, TestPatch::from_outcome(&outcome, status, now_ms))
        }
        None => {
            // No outcome line: the runner itself died (spawn failure,
            // timeout kill, crash).
            let error = report
                .error
                .clone()
                .unwrap_or_else(|| format!("runner produced no outcome: {}", report.stderr));
            let patch = TestPatch {
                status: Some(TestStatus::Crashed),
                finished_at: Some(now_ms),
                duration_ms: Some(report.duration_ms),
                error_message: Some(error),
                ..Default::default()
            };
            (TestStatus::Crashed, patch)
        }
    }
}

/// Keep the raw runner output under the per-run log directory.
fn persist_logs(dirs: &StateDirs, run_id: &str, test: &DiscoveredTest, report: &ExecReport) {
    let dir = dirs.run_log_dir(run_id, &test.use_case, &test.test_case);
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let _ = std::fs::write(dir.join("stdout.log"), &report.stdout);
    let _ = std::fs::write(dir.join("stderr.log"), &report.stderr);
}

/// The runner binary ships next to the CLI.
fn default_runner_binary() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("locating current executable")?;
    let dir = exe.parent().context("executable has no parent directory")?;
    let candidate = dir.join("tsuite-runner");
    anyhow::ensure!(
        candidate.is_file(),
        "tsuite-runner not found next to {} (pass --runner-path)",
        exe.display()
    );
    Ok(candidate)
}

//! Run lifecycle endpoints: creation, idempotent test reporting, terminal
//! transitions, rerun, and the grouped tests tree.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ApiError, ApiResult, AppState};
use crate::contracts::{CreateRunRequest, TestPatch};
use crate::events::RunEvent;
use crate::store::{
    AssertionResultRecord, PendingTest, RunRecord, StepResultRecord, TestResultRecord, TestStatus,
    TestUpdate, UpdateOutcome,
};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<RunRecord>>> {
    Ok(Json(state.store.list_runs(query.limit).await?))
}

pub async fn get(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunRecord>> {
    Ok(Json(state.store.get_run(&run_id).await?))
}

/// Create a run row and pre-populate its test rows, then announce it.
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> ApiResult<Json<RunRecord>> {
    let pending: Vec<PendingTest> = request
        .tests
        .iter()
        .map(|t| PendingTest {
            test_id: t.test_id.clone(),
            use_case: t.use_case.clone(),
            test_case: t.test_case.clone(),
            name: t.name.clone(),
            tags: t.tags.clone(),
        })
        .collect();

    let run = state
        .store
        .create_run(
            &request.run_id,
            request.suite_id,
            &request.display_name,
            &request.mode,
            &request.version,
            &pending,
        )
        .await?;

    state.hub.emit(RunEvent::RunStarted {
        run_id: run.run_id.clone(),
        display_name: run.display_name.clone(),
        total_tests: run.total_tests,
        timestamp: Utc::now(),
    });
    info!(run_id = %run.run_id, total = run.total_tests, "run registered");
    Ok(Json(run))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.store.delete_run(&run_id).await?;
    state.hub.emit(RunEvent::RunDeleted {
        run_id: run_id.clone(),
        timestamp: Utc::now(),
    });
    Ok(Json(serde_json::json!({ "deleted": run_id })))
}

/// Idempotent status/step upload for one test.
///
/// Terminal rows are left untouched and acknowledged with
/// `skipped = true, reason = "already terminal"`. Step, assertion, and
/// capture rows are append-only; re-uploads deduplicate on their unique
/// keys.
pub async fn patch_test(
    State(state): State<AppState>,
    Path((run_id, test_id)): Path<(String, String)>,
    Json(patch): Json<TestPatch>,
) -> ApiResult<Json<UpdateOutcome>> {
    let test_id = test_id.trim_start_matches('/').to_string();

    let update = TestUpdate {
        status: patch.status,
        started_at: patch.started_at,
        finished_at: patch.finished_at,
        duration_ms: patch.duration_ms,
        error_message: patch.error_message.clone(),
        error_step: patch.error_step.clone(),
        steps_passed: (!patch.steps.is_empty())
            .then(|| patch.steps.iter().filter(|s| s.status == "passed").count() as i64),
        steps_failed: (!patch.steps.is_empty())
            .then(|| patch.steps.iter().filter(|s| s.status != "passed").count() as i64),
        steps_json: (!patch.steps.is_empty())
            .then(|| serde_json::to_string(&patch.steps).unwrap_or_default()),
    };

    let outcome = state.store.update_test(&run_id, &test_id, &update).await?;
    if outcome.skipped {
        return Ok(Json(outcome));
    }

    // Child rows ride along with whichever patch carries them.
    let record = state.store.get_test_result(&run_id, &test_id).await?;
    for step in &patch.steps {
        let row = StepResultRecord {
            id: 0,
            test_result_id: record.id,
            step_index: step.index as i64,
            phase: step.phase.as_str().to_string(),
            handler: step.handler.clone(),
            description: step.description.clone(),
            status: step.status.clone(),
            started_at: Some(step.started_at),
            finished_at: Some(step.finished_at),
            duration_ms: Some(step.duration_ms),
            exit_code: step.exit_code,
            stdout: step.stdout.clone(),
            stderr: step.stderr.clone(),
            error_message: step.error.clone(),
        };
        state.store.add_step_result(record.id, &row).await?;
    }
    for assertion in &patch.assertions {
        let row = AssertionResultRecord {
            id: 0,
            test_result_id: record.id,
            assertion_index: assertion.index as i64,
            expression: assertion.expression.clone(),
            message: assertion.message.clone(),
            passed: assertion.passed,
            actual_value: assertion.actual_value.clone(),
            expected_value: assertion.expected_value.clone(),
        };
        state.store.add_assertion_result(record.id, &row).await?;
    }
    for (key, value) in &patch.captured {
        state.store.add_captured_value(record.id, key, value).await?;
    }

    match patch.status {
        Some(TestStatus::Running) => {
            state.hub.emit(RunEvent::TestStarted {
                run_id: run_id.clone(),
                test_id: test_id.clone(),
                timestamp: Utc::now(),
            });
        }
        Some(status) if status.is_terminal() => {
            state.hub.emit(RunEvent::TestCompleted {
                run_id: run_id.clone(),
                test_id: test_id.clone(),
                status: status.as_str().to_string(),
                duration_ms: patch.duration_ms,
                error_message: patch.error_message.clone(),
                timestamp: Utc::now(),
            });
        }
        _ => {}
    }

    Ok(Json(outcome))
}

/// Terminal transition after all workers drained.
pub async fn complete(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunRecord>> {
    let run = state.store.complete_run(&run_id).await?;
    state.hub.emit(RunEvent::RunCompleted {
        run_id: run.run_id.clone(),
        passed: run.passed,
        failed: run.failed,
        skipped: run.skipped,
        duration_ms: run.duration_ms.unwrap_or_default(),
        timestamp: Utc::now(),
    });
    Ok(Json(run))
}

/// Cancel a run: flag it for the orchestrator's poller, skip everything
/// not yet terminal, and finalize the row. Safe to call repeatedly.
pub async fn cancel(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunRecord>> {
    let run = state.store.get_run(&run_id).await?;
    if run.status.is_terminal() {
        return Ok(Json(run));
    }

    state.store.request_cancel(&run_id).await?;
    state.hub.emit(RunEvent::CancelRequested {
        run_id: run_id.clone(),
        timestamp: Utc::now(),
    });

    let run = state.store.mark_cancelled(&run_id).await?;
    state.hub.emit(RunEvent::RunCancelled {
        run_id: run_id.clone(),
        timestamp: Utc::now(),
    });
    Ok(Json(run))
}

/// Administrative counter repair.
pub async fn recount(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunRecord>> {
    Ok(Json(state.store.recompute_counters(&run_id).await?))
}

#[derive(Debug, Serialize)]
pub struct RerunResponse {
    pub spawned: bool,
    pub uc: Option<String>,
    pub tc: Option<String>,
}

/// Rerun a prior run. Scope is reconstructed from its tests: a single test
/// becomes a `tc` filter, a single use case a `uc` filter, anything wider
/// the full suite.
pub async fn rerun(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RerunResponse>> {
    let run = state.store.get_run(&run_id).await?;
    let suite_id = run
        .suite_id
        .ok_or_else(|| ApiError::BadRequest("run has no registered suite".to_string()))?;
    let suite = state.store.get_suite(suite_id).await?;
    let tests = state.store.list_test_results(&run_id).await?;

    let (uc, tc) = rerun_scope(&tests);
    let mut cmd = tokio::process::Command::new(&state.orchestrator_binary);
    cmd.arg("run")
        .arg("--suite-path")
        .arg(&suite.folder_path)
        .arg("--api-url")
        .arg(&state.public_url)
        .env("TSUITE_DETACHED", "1")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(uc) = &uc {
        cmd.args(["--uc", uc]);
    }
    if let Some(tc) = &tc {
        cmd.args(["--tc", tc]);
    }

    cmd.spawn()
        .map_err(|e| ApiError::Internal(format!("failed to spawn orchestrator: {e}")))?;
    info!(run_id, ?uc, ?tc, "rerun spawned");
    Ok(Json(RerunResponse {
        spawned: true,
        uc,
        tc,
    }))
}

/// Derive rerun filters from a run's test set.
fn rerun_scope(tests: &[TestResultRecord]) -> (Option<String>, Option<String>) {
    if tests.len() == 1 {
        return (None, Some(tests[0].test_id.clone()));
    }
    let mut use_cases: Vec<&str> = tests.iter().map(|t| t.use_case.as_str()).collect();
    use_cases.sort_unstable();
    use_cases.dedup();
    if use_cases.len() == 1 {
        return (Some(use_cases[0].to_string()), None);
    }
    (None, None)
}

#[derive(Debug, Serialize)]
pub struct UseCaseGroup {
    pub use_case: String,
    pub pending: i64,
    pub running: i64,
    pub passed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub tests: Vec<TestResultRecord>,
}

#[derive(Debug, Serialize)]
pub struct TestsTree {
    pub run_id: String,
    pub use_cases: Vec<UseCaseGroup>,
}

/// The run's tests grouped by use case with bucket counts. Running tests
/// sort first by start time, the rest by test-case name.
pub async fn tests_tree(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<TestsTree>> {
    state.store.get_run(&run_id).await?;
    let tests = state.store.list_test_results(&run_id).await?;

    let mut groups: Vec<UseCaseGroup> = Vec::new();
    for test in tests {
        let group = match groups.iter_mut().find(|g| g.use_case == test.use_case) {
            Some(group) => group,
            None => {
                groups.push(UseCaseGroup {
                    use_case: test.use_case.clone(),
                    pending: 0,
                    running: 0,
                    passed: 0,
                    failed: 0,
                    skipped: 0,
                    tests: Vec::new(),
                });
                groups.last_mut().expect("just pushed")
            }
        };
        match test.status {
            TestStatus::Pending => group.pending += 1,
            TestStatus::Running => group.running += 1,
            TestStatus::Passed => group.passed += 1,
            TestStatus::Failed | TestStatus::Crashed => group.failed += 1,
            TestStatus::Skipped => group.skipped += 1,
        }
        group.tests.push(test);
    }

    groups.sort_by(|a, b| a.use_case.cmp(&b.use_case));
    for group in &mut groups {
        group.tests.sort_by(|a, b| {
            let a_running = a.status == TestStatus::Running;
            let b_running = b.status == TestStatus::Running;
            match (a_running, b_running) {
                (true, true) => a
                    .started_at
                    .unwrap_or(i64::MAX)
                    .cmp(&b.started_at.unwrap_or(i64::MAX)),
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                (false, false) => a.test_case.cmp(&b.test_case),
            }
        });
    }

    if groups.is_empty() {
        warn!(run_id, "tests tree requested for run with no tests");
    }
    Ok(Json(TestsTree { run_id, use_cases: groups }))
}

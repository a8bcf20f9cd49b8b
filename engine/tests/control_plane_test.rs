//! End-to-end tests of the control service over its HTTP surface.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use engine::events::EventHub;
use engine::paths::StateDirs;
use engine::server::{router, AppState};
use engine::store::Store;

struct Harness {
    state: AppState,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("results.db")).await.unwrap();
    let state = AppState {
        store: Arc::new(store),
        hub: EventHub::new().shared(),
        dirs: StateDirs::at(dir.path()),
        orchestrator_binary: PathBuf::from("/bin/true"),
        public_url: "http://127.0.0.1:0".to_string(),
    };
    Harness { state, _dir: dir }
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn call(state: &AppState, req: Request<Body>) -> (StatusCode, Value) {
    let response = router(state.clone()).oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn create_run_body(run_id: &str, test_ids: &[&str]) -> Value {
    let tests: Vec<Value> = test_ids
        .iter()
        .map(|id| {
            let (uc, tc) = id.split_once('/').unwrap();
            json!({"test_id": id, "use_case": uc, "test_case": tc, "name": id, "tags": []})
        })
        .collect();
    json!({
        "run_id": run_id,
        "display_name": "integration run",
        "mode": "standalone",
        "version": "0.1.0",
        "tests": tests
    })
}

#[tokio::test]
async fn test_run_lifecycle_to_completion() {
    let h = harness().await;

    let (status, run) = call(
        &h.state,
        request("POST", "/api/runs", Some(create_run_body("r1", &["uc1/tc01"]))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["total_tests"], 1);
    assert_eq!(run["pending_count"], 1);

    // running, then passed with steps and an assertion
    let (status, _) = call(
        &h.state,
        request(
            "PATCH",
            "/api/runs/r1/test/uc1/tc01",
            Some(json!({"status": "running", "started_at": 1000})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, outcome) = call(
        &h.state,
        request(
            "PATCH",
            "/api/runs/r1/test/uc1/tc01",
            Some(json!({
                "status": "passed",
                "finished_at": 2000,
                "duration_ms": 1000,
                "steps": [{
                    "phase": "test", "index": 0, "handler": "shell",
                    "description": "echo", "status": "passed",
                    "started_at": 1000, "finished_at": 1500, "duration_ms": 500,
                    "exit_code": 0, "stdout": "hello\n", "stderr": ""
                }],
                "assertions": [{
                    "index": 0,
                    "expression": "${last.stdout} contains 'hello'",
                    "passed": true,
                    "actual_value": "hello\n",
                    "expected_value": "hello"
                }],
                "captured": {"out": "hello"}
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["skipped"], false);

    let (_, run) = call(&h.state, request("POST", "/api/runs/r1/complete", None)).await;
    assert_eq!(run["status"], "completed");
    assert_eq!(run["passed"], 1);
    assert_eq!(run["failed"], 0);
    assert!(run["duration_ms"].as_i64().is_some());

    // Child rows landed
    let record = h.state.store.get_test_result("r1", "uc1/tc01").await.unwrap();
    assert_eq!(record.steps_passed, 1);
    let steps = h.state.store.list_step_results(record.id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].stdout, "hello\n");
    let assertions = h.state.store.list_assertion_results(record.id).await.unwrap();
    assert_eq!(assertions.len(), 1);
    assert!(assertions[0].passed);
    let captures = h.state.store.list_captured_values(record.id).await.unwrap();
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].value, "hello");
}

#[tokio::test]
async fn test_idempotent_reporter_after_terminal() {
    let h = harness().await;
    call(
        &h.state,
        request("POST", "/api/runs", Some(create_run_body("r1", &["uc1/tc01"]))),
    )
    .await;

    call(
        &h.state,
        request(
            "PATCH",
            "/api/runs/r1/test/uc1/tc01",
            Some(json!({"status": "passed"})),
        ),
    )
    .await;

    // The late conflicting report answers 200 with skipped=true and
    // changes nothing.
    let (status, body) = call(
        &h.state,
        request(
            "PATCH",
            "/api/runs/r1/test/uc1/tc01",
            Some(json!({"status": "failed", "error_message": "late"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["skipped"], true);
    assert_eq!(body["reason"], "already terminal");

    let (_, run) = call(&h.state, request("GET", "/api/runs/r1", None)).await;
    assert_eq!(run["passed"], 1);
    assert_eq!(run["failed"], 0);
    let record = h.state.store.get_test_result("r1", "uc1/tc01").await.unwrap();
    assert!(record.error_message.is_none());
}

#[tokio::test]
async fn test_cancellation_fans_out_to_skipped() {
    let h = harness().await;
    let ids: Vec<String> = (1..=10).map(|i| format!("uc1/tc{i:02}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    call(
        &h.state,
        request("POST", "/api/runs", Some(create_run_body("r1", &id_refs))),
    )
    .await;

    // Two in flight, one already passed.
    for (test, status) in [("uc1/tc01", "passed"), ("uc1/tc02", "running"), ("uc1/tc03", "running")] {
        call(
            &h.state,
            request(
                "PATCH",
                &format!("/api/runs/r1/test/{test}"),
                Some(json!({"status": status})),
            ),
        )
        .await;
    }

    let (status, run) = call(&h.state, request("POST", "/api/runs/r1/cancel", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "cancelled");
    assert_eq!(run["cancel_requested"], true);
    assert_eq!(run["passed"], 1);
    assert_eq!(run["skipped"], 9);
    assert_eq!(run["pending_count"], 0);
    assert_eq!(run["running_count"], 0);

    // The invariant holds after the fan-out.
    let total = run["passed"].as_i64().unwrap()
        + run["failed"].as_i64().unwrap()
        + run["skipped"].as_i64().unwrap()
        + run["pending_count"].as_i64().unwrap()
        + run["running_count"].as_i64().unwrap();
    assert_eq!(total, run["total_tests"].as_i64().unwrap());

    // Once cancel_requested is set no test may move to running.
    let (_, body) = call(
        &h.state,
        request(
            "PATCH",
            "/api/runs/r1/test/uc1/tc05",
            Some(json!({"status": "running"})),
        ),
    )
    .await;
    assert_eq!(body["skipped"], true);

    // A second cancel is a no-op answering the terminal row.
    let (status, run) = call(&h.state, request("POST", "/api/runs/r1/cancel", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "cancelled");
}

#[tokio::test]
async fn test_tests_tree_grouping_and_ordering() {
    let h = harness().await;
    call(
        &h.state,
        request(
            "POST",
            "/api/runs",
            Some(create_run_body(
                "r1",
                &["uc1/tc01", "uc1/tc02", "uc1/tc03", "uc2/tc01"],
            )),
        ),
    )
    .await;

    // tc03 started before tc02; both running. tc01 finished.
    call(
        &h.state,
        request(
            "PATCH",
            "/api/runs/r1/test/uc1/tc03",
            Some(json!({"status": "running", "started_at": 100})),
        ),
    )
    .await;
    call(
        &h.state,
        request(
            "PATCH",
            "/api/runs/r1/test/uc1/tc02",
            Some(json!({"status": "running", "started_at": 200})),
        ),
    )
    .await;
    call(
        &h.state,
        request(
            "PATCH",
            "/api/runs/r1/test/uc1/tc01",
            Some(json!({"status": "passed"})),
        ),
    )
    .await;

    let (status, tree) = call(&h.state, request("GET", "/api/runs/r1/tests/tree", None)).await;
    assert_eq!(status, StatusCode::OK);
    let groups = tree["use_cases"].as_array().unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["use_case"], "uc1");
    assert_eq!(groups[0]["running"], 2);
    assert_eq!(groups[0]["passed"], 1);

    // Running first by started_at ascending, then the rest by name.
    let ordered: Vec<&str> = groups[0]["tests"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["test_case"].as_str().unwrap())
        .collect();
    assert_eq!(ordered, vec!["tc03", "tc02", "tc01"]);
}

#[tokio::test]
async fn test_delete_run_emits_and_cascades() {
    let h = harness().await;
    call(
        &h.state,
        request("POST", "/api/runs", Some(create_run_body("r1", &["uc1/tc01"]))),
    )
    .await;

    let mut sub = h.state.hub.subscribe_run("r1");
    let (status, _) = call(&h.state, request("DELETE", "/api/runs/r1", None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&h.state, request("GET", "/api/runs/r1", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Subscribers saw the terminal event.
    let mut saw_deleted = false;
    while let Ok(event) = sub.receiver.try_recv() {
        if event.event_type() == "run_deleted" {
            saw_deleted = true;
        }
    }
    assert!(saw_deleted);
}

#[tokio::test]
async fn test_emit_forwards_to_hub() {
    let h = harness().await;
    let mut sub = h.state.hub.subscribe_global();

    let (status, body) = call(
        &h.state,
        request(
            "POST",
            "/api/events/emit",
            Some(json!({
                "type": "test_started",
                "run_id": "r9",
                "test_id": "uc/tc",
                "timestamp": "2026-01-01T00:00:00Z"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["emitted"], true);

    let event = sub.receiver.try_recv().unwrap();
    assert_eq!(event.event_type(), "test_started");
    assert_eq!(event.run_id(), Some("r9"));
}

#[tokio::test]
async fn test_browse_denies_system_paths() {
    let h = harness().await;
    let (status, _) = call(&h.state, request("GET", "/api/browse?path=/proc", None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(&h.state, request("GET", "/api/browse?path=/", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["entries"].as_array().is_some());
}

#[tokio::test]
async fn test_suite_registration_and_config_edit() {
    let h = harness().await;
    let suite_dir = tempfile::tempdir().unwrap();
    std::fs::write(
        suite_dir.path().join("config.yaml"),
        "# suite config\nsuite:\n  name: mesh  # keep me\n  mode: standalone\nexecution:\n  max_workers: 2\n",
    )
    .unwrap();
    let test_dir = suite_dir.path().join("suites/uc1/tc01");
    std::fs::create_dir_all(&test_dir).unwrap();
    std::fs::write(
        test_dir.join("test.yaml"),
        "name: t\ntest:\n  - handler: shell\n    command: echo hi\n",
    )
    .unwrap();

    let (status, suite) = call(
        &h.state,
        request(
            "POST",
            "/api/suites",
            Some(json!({"folder_path": suite_dir.path().display().to_string()})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(suite["name"], "mesh");
    assert_eq!(suite["test_count"], 1);
    let id = suite["id"].as_i64().unwrap();

    // Edit config through the comment-preserving path.
    let (status, edited) = call(
        &h.state,
        request(
            "PUT",
            &format!("/api/suites/{id}/config"),
            Some(json!({"execution": {"max_workers": 8}})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let content = edited["content"].as_str().unwrap();
    assert!(content.contains("# suite config"));
    assert!(content.contains("# keep me"));
    assert!(content.contains("max_workers: 8"));

    // Step editing on test.yaml
    let (status, edited) = call(
        &h.state,
        request(
            "POST",
            &format!("/api/suites/{id}/test-step"),
            Some(json!({
                "uc": "uc1", "tc": "tc01", "phase": "test",
                "step": {"handler": "shell", "command": "echo two"}
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(edited["content"].as_str().unwrap().contains("echo two"));

    let (status, _) = call(
        &h.state,
        request(
            "DELETE",
            &format!("/api/suites/{id}/test-step"),
            Some(json!({"uc": "uc1", "tc": "tc01", "phase": "test", "index": 0})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, file) = call(
        &h.state,
        request(
            "GET",
            &format!("/api/suites/{id}/test-yaml?uc=uc1&tc=tc01"),
            None,
        ),
    )
    .await;
    let content = file["content"].as_str().unwrap();
    assert!(!content.contains("echo hi"));
    assert!(content.contains("echo two"));
}

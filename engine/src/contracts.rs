//! Wire contracts between the runner/orchestrator and the control service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::Phase;
use crate::interp::eval::EvalResult;
use crate::store::{TestStatus, UpdateOutcome};

/// Record of one executed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub phase: Phase,
    pub index: usize,
    pub handler: String,
    pub description: String,
    /// "passed", "failed", or "crashed"
    pub status: String,
    pub started_at: i64,
    pub finished_at: i64,
    pub duration_ms: i64,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRecord {
    /// "phase[index]" marker stored as `error_step` on failures.
    pub fn locator(&self) -> String {
        format!("{}[{}]", self.phase, self.index)
    }
}

/// Record of one evaluated assertion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionRecord {
    pub index: usize,
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub passed: bool,
    pub actual_value: String,
    pub expected_value: String,
}

impl AssertionRecord {
    pub fn from_eval(index: usize, expression: &str, message: Option<&str>, eval: &EvalResult) -> Self {
        Self {
            index,
            expression: expression.to_string(),
            message: message.map(str::to_string),
            passed: eval.passed,
            actual_value: eval.actual_value.clone(),
            expected_value: eval.expected_value.clone(),
        }
    }
}

/// Final outcome of one test execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test_id: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// "phase[index]" of the failing step, when a step failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_step: Option<String>,
    pub duration_ms: i64,
    pub steps: Vec<StepRecord>,
    pub assertions: Vec<AssertionRecord>,
    pub captured: BTreeMap<String, String>,
}

impl TestOutcome {
    pub fn steps_passed(&self) -> i64 {
        self.steps.iter().filter(|s| s.status == "passed").count() as i64
    }

    pub fn steps_failed(&self) -> i64 {
        self.steps.iter().filter(|s| s.status != "passed").count() as i64
    }
}

/// `POST /api/runs` request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunRequest {
    pub run_id: String,
    #[serde(default)]
    pub suite_id: Option<i64>,
    pub display_name: String,
    pub mode: String,
    #[serde(default)]
    pub version: String,
    pub tests: Vec<ScheduledTest>,
}

/// One test pre-registered with a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTest {
    pub test_id: String,
    pub use_case: String,
    pub test_case: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// `PATCH /api/runs/:run_id/test/*test_id` request body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TestStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_step: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<AssertionRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub captured: BTreeMap<String, String>,
}

impl TestPatch {
    /// Patch marking a test as running now.
    pub fn running(now_ms: i64) -> Self {
        Self {
            status: Some(TestStatus::Running),
            started_at: Some(now_ms),
            ..Default::default()
        }
    }

    /// Patch carrying a finished test's full outcome.
    pub fn from_outcome(outcome: &TestOutcome, status: TestStatus, now_ms: i64) -> Self {
        Self {
            status: Some(status),
            finished_at: Some(now_ms),
            duration_ms: Some(outcome.duration_ms),
            error_message: outcome.error.clone(),
            error_step: outcome.error_step.clone(),
            steps: outcome.steps.clone(),
            assertions: outcome.assertions.clone(),
            captured: outcome.captured.clone(),
            ..Default::default()
        }
    }
}

/// `PATCH …/test/*` response body: idempotency outcome
pub type PatchResponse = UpdateOutcome;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_locator() {
        let step = StepRecord {
            phase: Phase::PreRun,
            index: 0,
            handler: "shell".into(),
            description: "setup".into(),
            status: "failed".into(),
            started_at: 0,
            finished_at: 1,
            duration_ms: 1,
            exit_code: Some(1),
            stdout: String::new(),
            stderr: String::new(),
            error: None,
        };
        assert_eq!(step.locator(), "pre_run[0]");
    }

    #[test]
    fn test_patch_serialization_omits_empty() {
        let patch = TestPatch::running(1000);
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["status"], "running");
        assert_eq!(json["started_at"], 1000);
        assert!(json.get("steps").is_none());
        assert!(json.get("error_message").is_none());
    }

    #[test]
    fn test_outcome_step_tallies() {
        let mut outcome = TestOutcome {
            test_id: "uc/tc".into(),
            passed: false,
            error: None,
            error_step: None,
            duration_ms: 0,
            steps: Vec::new(),
            assertions: Vec::new(),
            captured: BTreeMap::new(),
        };
        for (i, status) in ["passed", "passed", "failed"].iter().enumerate() {
            outcome.steps.push(StepRecord {
                phase: Phase::Test,
                index: i,
                handler: "shell".into(),
                description: String::new(),
                status: status.to_string(),
                started_at: 0,
                finished_at: 0,
                duration_ms: 0,
                exit_code: None,
                stdout: String::new(),
                stderr: String::new(),
                error: None,
            });
        }
        assert_eq!(outcome.steps_passed(), 2);
        assert_eq!(outcome.steps_failed(), 1);
    }
}

//! Persistent record types for suites, runs, tests, steps, assertions, and
//! captures.

use serde::{Deserialize, Serialize};

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => RunStatus::Pending,
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "cancelled" => RunStatus::Cancelled,
            _ => RunStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Test result status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Crashed,
    Skipped,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pending => "pending",
            TestStatus::Running => "running",
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Crashed => "crashed",
            TestStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => TestStatus::Pending,
            "running" => TestStatus::Running,
            "passed" => TestStatus::Passed,
            "crashed" => TestStatus::Crashed,
            "skipped" => TestStatus::Skipped,
            _ => TestStatus::Failed,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestStatus::Passed | TestStatus::Failed | TestStatus::Crashed | TestStatus::Skipped
        )
    }

    /// Which run counter bucket this status feeds. Crashed tests count as
    /// failed.
    pub fn bucket(&self) -> &'static str {
        match self {
            TestStatus::Pending => "pending_count",
            TestStatus::Running => "running_count",
            TestStatus::Passed => "passed",
            TestStatus::Failed | TestStatus::Crashed => "failed",
            TestStatus::Skipped => "skipped",
        }
    }
}

/// A registered suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteRecord {
    pub id: i64,
    pub folder_path: String,
    pub name: String,
    /// "docker" or "standalone"
    pub mode: String,
    /// Parsed config.yaml as JSON
    pub config_json: String,
    pub test_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One execution attempt of a set of tests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub suite_id: Option<i64>,
    pub display_name: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: RunStatus,
    pub mode: String,
    pub total_tests: i64,
    pub pending_count: i64,
    pub running_count: i64,
    pub passed: i64,
    pub failed: i64,
    pub skipped: i64,
    /// Wall-clock `finished_at - started_at`, not a sum of child durations
    pub duration_ms: Option<i64>,
    pub cancel_requested: bool,
    pub version: String,
}

impl RunRecord {
    /// The counter invariant that must hold at all times.
    pub fn counters_consistent(&self) -> bool {
        self.pending_count + self.running_count + self.passed + self.failed + self.skipped
            == self.total_tests
    }
}

/// Result of one test within a run; unique per `(run_id, test_id)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResultRecord {
    pub id: i64,
    pub run_id: String,
    pub test_id: String,
    pub use_case: String,
    pub test_case: String,
    pub name: String,
    /// JSON array of tag strings
    pub tags: String,
    pub status: TestStatus,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    /// "phase[index]" of the failing step
    pub error_step: Option<String>,
    pub steps_passed: i64,
    pub steps_failed: i64,
    /// Full step records as JSON, for the reporting surface
    pub steps_json: Option<String>,
}

/// Result of one step; unique per `(test_result_id, phase, step_index)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResultRecord {
    pub id: i64,
    pub test_result_id: i64,
    pub step_index: i64,
    pub phase: String,
    pub handler: String,
    pub description: String,
    pub status: String,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub error_message: Option<String>,
}

/// Result of one assertion; unique per `(test_result_id, assertion_index)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionResultRecord {
    pub id: i64,
    pub test_result_id: i64,
    pub assertion_index: i64,
    pub expression: String,
    pub message: Option<String>,
    pub passed: bool,
    pub actual_value: String,
    pub expected_value: String,
}

/// A captured value; unique per `(test_result_id, key)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedValueRecord {
    pub id: i64,
    pub test_result_id: i64,
    pub key: String,
    pub value: String,
    pub captured_at: i64,
}

/// Fields a status update may carry alongside the transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestUpdate {
    pub status: Option<TestStatus>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub error_step: Option<String>,
    pub steps_passed: Option<i64>,
    pub steps_failed: Option<i64>,
    pub steps_json: Option<String>,
}

/// Outcome of an idempotent update request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl UpdateOutcome {
    pub fn applied() -> Self {
        Self {
            skipped: false,
            reason: None,
        }
    }

    pub fn already_terminal() -> Self {
        Self {
            skipped: true,
            reason: Some("already terminal".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TestStatus::Pending,
            TestStatus::Running,
            TestStatus::Passed,
            TestStatus::Failed,
            TestStatus::Crashed,
            TestStatus::Skipped,
        ] {
            assert_eq!(TestStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TestStatus::Pending.is_terminal());
        assert!(!TestStatus::Running.is_terminal());
        assert!(TestStatus::Passed.is_terminal());
        assert!(TestStatus::Failed.is_terminal());
        assert!(TestStatus::Crashed.is_terminal());
        assert!(TestStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_crashed_feeds_failed_bucket() {
        assert_eq!(TestStatus::Crashed.bucket(), "failed");
        assert_eq!(TestStatus::Failed.bucket(), "failed");
        assert_eq!(TestStatus::Pending.bucket(), "pending_count");
    }

    #[test]
    fn test_counter_invariant_check() {
        let mut run = RunRecord {
            run_id: "r".into(),
            suite_id: None,
            display_name: "r".into(),
            started_at: 0,
            finished_at: None,
            status: RunStatus::Running,
            mode: "standalone".into(),
            total_tests: 4,
            pending_count: 2,
            running_count: 1,
            passed: 1,
            failed: 0,
            skipped: 0,
            duration_ms: None,
            cancel_requested: false,
            version: "0".into(),
        };
        assert!(run.counters_consistent());
        run.passed += 1;
        assert!(!run.counters_consistent());
    }
}

//! Isolated per-test execution environments.
//!
//! Two strategies share one interface: `standalone` runs the runner binary
//! on the host inside a scratch directory; `docker` runs it inside an
//! ephemeral container. Both honor cooperative cancellation: a cancelled
//! test reports `cancelled`, never `failed`.

mod docker;
mod standalone;

pub use docker::DockerStrategy;
pub use standalone::StandaloneStrategy;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::SuiteConfig;
use crate::contracts::TestOutcome;

/// Execution context shared by every test of a run.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub suite_path: PathBuf,
    pub config: SuiteConfig,
    /// Base directory for per-test scratch workdirs
    pub scratch_base: PathBuf,
    /// Path to the `tsuite-runner` binary
    pub runner_binary: PathBuf,
    /// Control service base URL, passed through so the in-environment
    /// runner reports progress
    pub server_url: String,
    pub run_id: String,
    pub cancel: CancellationToken,
}

impl ExecContext {
    /// Per-test timeout: the test's own `timeout` or the suite default.
    pub fn test_timeout(&self, test_id: &str) -> u64 {
        let spec_timeout = test_id.split_once('/').and_then(|(uc, tc)| {
            crate::config::TestSpec::load(
                &self.suite_path.join("suites").join(uc).join(tc).join("test.yaml"),
            )
            .ok()
            .and_then(|spec| spec.timeout)
        });
        spec_timeout.unwrap_or(self.config.execution.timeout)
    }

    /// Scratch directory for one test, under the shared base.
    pub fn scratch_dir(&self, test_id: &str) -> PathBuf {
        self.scratch_base.join(test_id.replace('/', "-"))
    }
}

/// Result of executing one test in an isolated environment.
#[derive(Debug, Clone, Default)]
pub struct ExecReport {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl ExecReport {
    pub fn cancelled(duration_ms: i64) -> Self {
        Self {
            duration_ms,
            cancelled: true,
            error: Some("Run cancelled".to_string()),
            ..Default::default()
        }
    }

    /// The runner prints its outcome as the last JSON line on stdout;
    /// recover it from the captured stream.
    pub fn parse_outcome(&self) -> Option<TestOutcome> {
        self.stdout
            .lines()
            .rev()
            .find(|line| line.trim_start().starts_with('{'))
            .and_then(|line| serde_json::from_str(line).ok())
    }
}

/// An isolated execution strategy.
#[async_trait]
pub trait ExecStrategy: Send + Sync {
    async fn execute(&self, ctx: &ExecContext, test_id: &str) -> ExecReport;
}

/// Pick the strategy the suite's mode asks for.
pub fn strategy_for(config: &SuiteConfig) -> Box<dyn ExecStrategy> {
    if config.is_docker() {
        Box::new(DockerStrategy)
    } else {
        Box::new(StandaloneStrategy)
    }
}

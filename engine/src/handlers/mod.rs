//! Step handlers — one executor per step kind.
//!
//! A handler receives the step map with every `${…}` already resolved, runs
//! its effect, and reports a [`StepOutput`]. Timeouts surface as failed
//! outputs with exit code 124, not as errors.

pub mod file;
pub mod http;
pub mod install;
pub mod shell;
pub mod wait;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::PackagesSection;

/// Exit code reported when a step exceeds its deadline.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Error type for handler execution
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler {handler}: missing required field '{field}'")]
    MissingField {
        handler: &'static str,
        field: &'static str,
    },

    #[error("handler {handler}: invalid step: {reason}")]
    InvalidStep {
        handler: &'static str,
        reason: String,
    },

    #[error("unknown handler: {0}")]
    UnknownHandler(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type for handler execution
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Outcome of one handler invocation
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StepOutput {
    pub success: bool,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepOutput {
    pub fn success_with(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Environment a handler executes in: resolved directories, suite package
/// settings, and the fallback timeout.
#[derive(Debug, Clone)]
pub struct HandlerEnv {
    pub suite_path: PathBuf,
    pub workdir: PathBuf,
    pub packages: PackagesSection,
    /// Default per-step timeout in seconds
    pub default_timeout: u64,
}

impl HandlerEnv {
    pub fn new(suite_path: PathBuf, workdir: PathBuf) -> Self {
        Self {
            suite_path,
            workdir,
            packages: PackagesSection::default(),
            default_timeout: 120,
        }
    }

    /// Effective timeout: the step's own `timeout` field or the default.
    pub fn step_timeout(&self, step: &Map<String, Value>) -> u64 {
        step.get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_timeout)
    }

    /// Working directory for a step: its `workdir` field resolved against
    /// the test workdir, or the test workdir itself.
    pub fn step_workdir(&self, step: &Map<String, Value>) -> PathBuf {
        match step.get("workdir").and_then(Value::as_str) {
            Some(dir) => {
                let p = PathBuf::from(dir);
                if p.is_absolute() {
                    p
                } else {
                    self.workdir.join(p)
                }
            }
            None => self.workdir.clone(),
        }
    }
}

/// A step executor. Implementations are stateless and shared across tests.
#[async_trait]
pub trait Handler: Send + Sync {
    /// The `handler:` name this executor answers to.
    fn name(&self) -> &'static str;

    /// Run one pre-interpolated step.
    async fn execute(&self, step: &Map<String, Value>, env: &HandlerEnv)
        -> HandlerResult<StepOutput>;
}

/// Registry of handlers by name.
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Registry with all built-in handlers.
    pub fn builtin() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register(Arc::new(shell::ShellHandler));
        registry.register(Arc::new(wait::WaitHandler));
        registry.register(Arc::new(http::HttpHandler::new()));
        registry.register(Arc::new(file::FileHandler));
        registry.register(Arc::new(install::PipInstallHandler));
        registry.register(Arc::new(install::NpmInstallHandler));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.name(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    /// Execute a step through its handler, honoring `ignore_errors`: the
    /// output reports success while the underlying exit code is retained.
    pub async fn dispatch(
        &self,
        handler_name: &str,
        step: &Map<String, Value>,
        ignore_errors: bool,
        env: &HandlerEnv,
    ) -> HandlerResult<StepOutput> {
        let handler = self
            .get(handler_name)
            .ok_or_else(|| HandlerError::UnknownHandler(handler_name.to_string()))?;
        let mut output = handler.execute(step, env).await?;
        if ignore_errors && !output.success {
            output.success = true;
        }
        Ok(output)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Run a command with a deadline.
///
/// The child goes into its own process group so that on timeout the whole
/// tree dies with it: `process_group(0)` calls `setpgid(0, 0)`, and when the
/// dropped future fires `kill_on_drop` the group's descendants (shells,
/// package managers) go down together. Timeout reports exit code 124.
pub(crate) async fn run_with_deadline(
    mut cmd: tokio::process::Command,
    timeout_secs: u64,
) -> HandlerResult<StepOutput> {
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let deadline = Duration::from_secs(timeout_secs);
    match tokio::time::timeout(deadline, cmd.output()).await {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().map(i64::from).unwrap_or(-1);
            Ok(StepOutput {
                success: output.status.success(),
                exit_code: Some(exit_code),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                error: if output.status.success() {
                    None
                } else {
                    Some(format!("command exited with code {exit_code}"))
                },
            })
        }
        Ok(Err(e)) => Err(HandlerError::Io(e)),
        Err(_) => Ok(StepOutput {
            success: false,
            exit_code: Some(TIMEOUT_EXIT_CODE),
            stdout: String::new(),
            stderr: String::new(),
            error: Some(format!("timed out after {timeout_secs}s")),
        }),
    }
}

/// Fetch a required string field from a step map.
pub(crate) fn required_str<'a>(
    step: &'a Map<String, Value>,
    handler: &'static str,
    field: &'static str,
) -> HandlerResult<&'a str> {
    step.get(field)
        .and_then(Value::as_str)
        .ok_or(HandlerError::MissingField { handler, field })
}

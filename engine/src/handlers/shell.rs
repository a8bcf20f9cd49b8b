//! Shell step handler.
//!
//! Runs `command` under `sh -c` in the step's working directory with stdout
//! and stderr captured separately. The deadline is enforced by killing the
//! child's process group.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::{required_str, run_with_deadline, Handler, HandlerEnv, HandlerResult, StepOutput};

pub struct ShellHandler;

#[async_trait]
impl Handler for ShellHandler {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn execute(
        &self,
        step: &Map<String, Value>,
        env: &HandlerEnv,
    ) -> HandlerResult<StepOutput> {
        let command = required_str(step, "shell", "command")?;
        let workdir = env.step_workdir(step);
        let timeout = env.step_timeout(step);
        debug!(command, workdir = %workdir.display(), timeout, "running shell step");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.args(["-c", command]).current_dir(&workdir);
        run_with_deadline(cmd, timeout).await
    }
}

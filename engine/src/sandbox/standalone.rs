//! Standalone isolation: a runner subprocess on the host with a per-test
//! scratch directory.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::{ExecContext, ExecReport, ExecStrategy};

pub struct StandaloneStrategy;

#[async_trait]
impl ExecStrategy for StandaloneStrategy {
    async fn execute(&self, ctx: &ExecContext, test_id: &str) -> ExecReport {
        let started = Instant::now();
        let workdir = ctx.scratch_dir(test_id);
        if let Err(e) = std::fs::create_dir_all(&workdir) {
            return ExecReport {
                error: Some(format!("failed to create workdir: {e}")),
                duration_ms: started.elapsed().as_millis() as i64,
                ..Default::default()
            };
        }

        let timeout = ctx.test_timeout(test_id);
        debug!(test_id, workdir = %workdir.display(), timeout, "spawning runner");

        let mut cmd = tokio::process::Command::new(&ctx.runner_binary);
        cmd.arg("--suite-path")
            .arg(&ctx.suite_path)
            .arg("--test-id")
            .arg(test_id)
            .arg("--workdir")
            .arg(&workdir)
            .arg("--server-url")
            .arg(&ctx.server_url)
            .arg("--run-id")
            .arg(&ctx.run_id)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so the timeout/cancel kill takes the whole
        // tree down, shell steps included.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecReport {
                    error: Some(format!("failed to spawn runner: {e}")),
                    duration_ms: started.elapsed().as_millis() as i64,
                    ..Default::default()
                }
            }
        };

        // Drain pipes concurrently so a chatty child cannot deadlock on a
        // full pipe while we wait.
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                warn!(test_id, "cancellation observed, killing runner");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return ExecReport::cancelled(started.elapsed().as_millis() as i64);
            }
            _ = tokio::time::sleep(Duration::from_secs(timeout)) => {
                warn!(test_id, timeout, "test deadline exceeded, killing runner");
                let _ = child.start_kill();
                let _ = child.wait().await;
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                return ExecReport {
                    exit_code: Some(crate::handlers::TIMEOUT_EXIT_CODE),
                    stdout,
                    stderr,
                    duration_ms: started.elapsed().as_millis() as i64,
                    error: Some(format!("test timed out after {timeout}s")),
                    cancelled: false,
                };
            }
            status = child.wait() => status,
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let duration_ms = started.elapsed().as_millis() as i64;

        match status {
            Ok(status) => ExecReport {
                exit_code: status.code().map(i64::from),
                stdout,
                stderr,
                duration_ms,
                error: None,
                cancelled: false,
            },
            Err(e) => ExecReport {
                stdout,
                stderr,
                duration_ms,
                error: Some(format!("runner wait failed: {e}")),
                ..Default::default()
            },
        }
    }
}

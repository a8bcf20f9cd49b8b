//! Docker isolation: one ephemeral container per test.
//!
//! The suite directory is mounted read-only, the scratch workdir
//! read-write, and the runner binary is injected at a fixed path. Docker is
//! driven through its CLI as a narrow adapter; cancellation and timeouts
//! kill the container by name.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::{ExecContext, ExecReport, ExecStrategy};

/// Mount points inside the container.
const SUITE_MOUNT: &str = "/suite";
const WORK_MOUNT: &str = "/work";
const RUNNER_MOUNT: &str = "/usr/local/bin/tsuite-runner";

pub struct DockerStrategy;

impl DockerStrategy {
    fn container_name(ctx: &ExecContext, test_id: &str) -> String {
        format!(
            "tsuite-{}-{}",
            &ctx.run_id[..8.min(ctx.run_id.len())],
            test_id.replace('/', "-")
        )
    }

    async fn kill_container(name: &str) {
        let _ = tokio::process::Command::new("docker")
            .args(["kill", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
}

#[async_trait]
impl ExecStrategy for DockerStrategy {
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
        let name = Self::container_name(ctx, test_id);
        let image = &ctx.config.docker.base_image;

        let mut cmd = tokio::process::Command::new("docker");
        cmd.args(["run", "--rm", "--name", &name])
            .arg("-v")
            .arg(format!("{}:{SUITE_MOUNT}:ro", ctx.suite_path.display()))
            .arg("-v")
            .arg(format!("{}:{WORK_MOUNT}:rw", workdir.display()))
            .arg("-v")
            .arg(format!("{}:{RUNNER_MOUNT}:ro", ctx.runner_binary.display()));
        if let Some(network) = &ctx.config.docker.network {
            cmd.args(["--network", network]);
        }
        cmd.arg(image)
            .arg("tsuite-runner")
            .args(["--suite-path", SUITE_MOUNT])
            .args(["--test-id", test_id])
            .args(["--workdir", WORK_MOUNT])
            .args(["--server-url", &ctx.server_url])
            .args(["--run-id", &ctx.run_id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(test_id, container = %name, image, timeout, "starting container");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecReport {
                    error: Some(format!("failed to invoke docker: {e}")),
                    duration_ms: started.elapsed().as_millis() as i64,
                    ..Default::default()
                }
            }
        };

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
                warn!(test_id, container = %name, "cancellation observed, killing container");
                Self::kill_container(&name).await;
                let _ = child.wait().await;
                return ExecReport::cancelled(started.elapsed().as_millis() as i64);
            }
            _ = tokio::time::sleep(Duration::from_secs(timeout)) => {
                warn!(test_id, container = %name, timeout, "container deadline exceeded");
                Self::kill_container(&name).await;
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
                error: Some(format!("docker wait failed: {e}")),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SuiteConfig;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_container_name_is_flat_and_scoped() {
        let ctx = ExecContext {
            suite_path: PathBuf::from("/suite"),
            config: SuiteConfig::default(),
            scratch_base: PathBuf::from("/tmp"),
            runner_binary: PathBuf::from("tsuite-runner"),
            server_url: String::new(),
            run_id: "0123456789abcdef".into(),
            cancel: CancellationToken::new(),
        };
        let name = DockerStrategy::container_name(&ctx, "uc1/tc01");
        assert_eq!(name, "tsuite-01234567-uc1-tc01");
        assert!(!name.contains('/'));
    }
}

//! Wait step handler: fixed sleeps and HTTP readiness polling.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::{Handler, HandlerEnv, HandlerError, HandlerResult, StepOutput, TIMEOUT_EXIT_CODE};

#[derive(Debug, Deserialize)]
struct WaitStep {
    /// "seconds" or "http"
    #[serde(rename = "type", default = "default_type")]
    kind: String,
    #[serde(default)]
    seconds: Option<f64>,
    #[serde(default)]
    url: Option<String>,
    /// Overall deadline for http polling, in seconds
    #[serde(default = "default_poll_timeout")]
    timeout: u64,
    /// Poll interval in seconds
    #[serde(default = "default_interval")]
    interval: f64,
}

fn default_type() -> String {
    "seconds".to_string()
}

fn default_poll_timeout() -> u64 {
    30
}

fn default_interval() -> f64 {
    1.0
}

pub struct WaitHandler;

#[async_trait]
impl Handler for WaitHandler {
    fn name(&self) -> &'static str {
        "wait"
    }

    async fn execute(
        &self,
        step: &Map<String, Value>,
        _env: &HandlerEnv,
    ) -> HandlerResult<StepOutput> {
        let spec: WaitStep = serde_json::from_value(Value::Object(step.clone())).map_err(|e| {
            HandlerError::InvalidStep {
                handler: "wait",
                reason: e.to_string(),
            }
        })?;

        match spec.kind.as_str() {
            "seconds" => {
                let seconds = spec.seconds.ok_or(HandlerError::MissingField {
                    handler: "wait",
                    field: "seconds",
                })?;
                debug!(seconds, "sleeping");
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                Ok(StepOutput::success_with(format!("waited {seconds}s")))
            }
            "http" => {
                let url = spec.url.ok_or(HandlerError::MissingField {
                    handler: "wait",
                    field: "url",
                })?;
                poll_until_ready(&url, spec.timeout, spec.interval).await
            }
            other => Err(HandlerError::InvalidStep {
                handler: "wait",
                reason: format!("unknown wait type '{other}'"),
            }),
        }
    }
}

/// Poll a URL until it answers with a status below 400 or the deadline
/// passes.
async fn poll_until_ready(url: &str, timeout_secs: u64, interval: f64) -> HandlerResult<StepOutput> {
    let client = reqwest::Client::new();
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match client.get(url).send().await {
            Ok(response) if response.status().as_u16() < 400 => {
                debug!(url, attempts, status = response.status().as_u16(), "ready");
                return Ok(StepOutput::success_with(format!(
                    "{url} ready after {attempts} attempt(s)"
                )));
            }
            Ok(response) => {
                debug!(url, status = response.status().as_u16(), "not ready yet");
            }
            Err(e) => {
                debug!(url, error = %e, "poll attempt failed");
            }
        }

        if Instant::now() >= deadline {
            return Ok(StepOutput {
                success: false,
                exit_code: Some(TIMEOUT_EXIT_CODE),
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!(
                    "{url} not ready after {timeout_secs}s ({attempts} attempts)"
                )),
            });
        }
        tokio::time::sleep(Duration::from_secs_f64(interval)).await;
    }
}

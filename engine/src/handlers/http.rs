//! HTTP request step handler.
//!
//! Success is a response status below 400; the response body becomes the
//! step's stdout so captures and `${json:…}` queries can pick it apart.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::{required_str, Handler, HandlerEnv, HandlerError, HandlerResult, StepOutput};

pub struct HttpHandler {
    client: reqwest::Client,
}

impl HttpHandler {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for HttpHandler {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn execute(
        &self,
        step: &Map<String, Value>,
        env: &HandlerEnv,
    ) -> HandlerResult<StepOutput> {
        let method = step
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let url = required_str(step, "http", "url")?;
        let timeout = env.step_timeout(step);

        let method: reqwest::Method =
            method
                .parse()
                .map_err(|_| HandlerError::InvalidStep {
                    handler: "http",
                    reason: format!("invalid method '{method}'"),
                })?;

        let mut request = self
            .client
            .request(method.clone(), url)
            .timeout(Duration::from_secs(timeout));

        if let Some(Value::Object(headers)) = step.get("headers") {
            for (name, value) in headers {
                if let Some(v) = value.as_str() {
                    request = request.header(name, v);
                }
            }
        }

        // A string body is sent verbatim; a map body is sent as JSON.
        match step.get("body") {
            Some(Value::String(text)) => request = request.body(text.clone()),
            Some(body @ Value::Object(_)) | Some(body @ Value::Array(_)) => {
                request = request.json(body)
            }
            _ => {}
        }

        debug!(%method, url, timeout, "sending http step request");
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Ok(StepOutput {
                    success: false,
                    exit_code: Some(super::TIMEOUT_EXIT_CODE),
                    error: Some(format!("request timed out after {timeout}s")),
                    ..Default::default()
                });
            }
            Err(e) => {
                return Ok(StepOutput {
                    success: false,
                    exit_code: None,
                    error: Some(format!("request failed: {e}")),
                    ..Default::default()
                });
            }
        };

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let success = status < 400;
        Ok(StepOutput {
            success,
            exit_code: Some(i64::from(status)),
            stdout: body,
            stderr: String::new(),
            error: if success {
                None
            } else {
                Some(format!("{method} {url} returned {status}"))
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn env() -> HandlerEnv {
        HandlerEnv::new(PathBuf::from("/suite"), std::env::temp_dir())
    }

    fn step(value: Value) -> Map<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    /// One-shot HTTP listener answering with a canned response.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_success_below_400() {
        let url = serve_once("200 OK", r#"{"ok":true}"#).await;
        let output = HttpHandler::new()
            .execute(&step(json!({"method": "GET", "url": url})), &env())
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.exit_code, Some(200));
        assert_eq!(output.stdout, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_error_status_fails_with_body() {
        let url = serve_once("503 Service Unavailable", "overloaded").await;
        let output = HttpHandler::new()
            .execute(&step(json!({"url": url})), &env())
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(503));
        assert_eq!(output.stdout, "overloaded");
        assert!(output.error.as_deref().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_failure_not_error() {
        let output = HttpHandler::new()
            .execute(
                &step(json!({"url": "http://127.0.0.1:59998/", "timeout": 2})),
                &env(),
            )
            .await
            .unwrap();
        assert!(!output.success);
        assert!(output.error.is_some());
    }

    #[tokio::test]
    async fn test_invalid_method_rejected() {
        let err = HttpHandler::new()
            .execute(
                &step(json!({"method": "NOT A METHOD", "url": "http://x"})),
                &env(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid method"));
    }

    #[tokio::test]
    async fn test_missing_url_rejected() {
        let err = HttpHandler::new()
            .execute(&step(json!({"method": "GET"})), &env())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("url"));
    }
}

//! File step handler: copy a file or write inline content, without a shell.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::{required_str, Handler, HandlerEnv, HandlerError, HandlerResult, StepOutput};

pub struct FileHandler;

#[async_trait]
impl Handler for FileHandler {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn execute(
        &self,
        step: &Map<String, Value>,
        env: &HandlerEnv,
    ) -> HandlerResult<StepOutput> {
        let dest = required_str(step, "file", "dest")?;
        let workdir = env.step_workdir(step);
        let dest_path = if std::path::Path::new(dest).is_absolute() {
            std::path::PathBuf::from(dest)
        } else {
            workdir.join(dest)
        };

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let source = step.get("source").and_then(Value::as_str);
        let content = step.get("content").and_then(Value::as_str);
        match (source, content) {
            (Some(source), _) => {
                let source_path = if std::path::Path::new(source).is_absolute() {
                    std::path::PathBuf::from(source)
                } else {
                    workdir.join(source)
                };
                debug!(source = %source_path.display(), dest = %dest_path.display(), "copying file");
                let bytes = tokio::fs::copy(&source_path, &dest_path).await?;
                Ok(StepOutput::success_with(format!(
                    "copied {} bytes to {}",
                    bytes,
                    dest_path.display()
                )))
            }
            (None, Some(content)) => {
                debug!(dest = %dest_path.display(), len = content.len(), "writing file");
                tokio::fs::write(&dest_path, content).await?;
                Ok(StepOutput::success_with(format!(
                    "wrote {} bytes to {}",
                    content.len(),
                    dest_path.display()
                )))
            }
            (None, None) => Err(HandlerError::InvalidStep {
                handler: "file",
                reason: "either 'source' or 'content' is required".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    fn env_in(dir: &std::path::Path) -> HandlerEnv {
        HandlerEnv::new(PathBuf::from("/suite"), dir.to_path_buf())
    }

    fn step(value: Value) -> Map<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_write_content() {
        let dir = tempfile::tempdir().unwrap();
        let output = FileHandler
            .execute(
                &step(json!({"dest": "conf/app.ini", "content": "key=1\n"})),
                &env_in(dir.path()),
            )
            .await
            .unwrap();
        assert!(output.success);
        let written = std::fs::read_to_string(dir.path().join("conf/app.ini")).unwrap();
        assert_eq!(written, "key=1\n");
    }

    #[tokio::test]
    async fn test_copy_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src.txt"), "payload").unwrap();
        let output = FileHandler
            .execute(
                &step(json!({"source": "src.txt", "dest": "copy.txt"})),
                &env_in(dir.path()),
            )
            .await
            .unwrap();
        assert!(output.success);
        let copied = std::fs::read_to_string(dir.path().join("copy.txt")).unwrap();
        assert_eq!(copied, "payload");
    }

    #[tokio::test]
    async fn test_missing_source_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileHandler
            .execute(
                &step(json!({"source": "absent.txt", "dest": "copy.txt"})),
                &env_in(dir.path()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Io(_)));
    }

    #[tokio::test]
    async fn test_neither_source_nor_content() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileHandler
            .execute(&step(json!({"dest": "x"})), &env_in(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("source"));
    }
}

//! Package installation handlers for Python and Node dependencies.
//!
//! Both choose between a local artifact directory and the public registry:
//! `packages.mode: local` forces local, `published` forces the registry, and
//! `auto` probes for the conventional `/wheels` / `/packages` directories.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{run_with_deadline, Handler, HandlerEnv, HandlerError, HandlerResult, StepOutput};

/// Conventional mount points inside docker-mode containers.
const DEFAULT_WHEELS_DIR: &str = "/wheels";
const DEFAULT_PACKAGES_DIR: &str = "/packages";

/// Where to install from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InstallSource {
    Local,
    Registry,
}

fn resolve_source(mode: &str, local_dir: &Path) -> InstallSource {
    match mode {
        "local" => InstallSource::Local,
        "published" => InstallSource::Registry,
        _ => {
            if local_dir.is_dir() {
                InstallSource::Local
            } else {
                InstallSource::Registry
            }
        }
    }
}

/// Explicit package list from the step, if present.
fn package_list(step: &Map<String, Value>) -> Vec<String> {
    step.get("packages")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub struct PipInstallHandler;

#[async_trait]
impl Handler for PipInstallHandler {
    fn name(&self) -> &'static str {
        "pip-install"
    }

    async fn execute(
        &self,
        step: &Map<String, Value>,
        env: &HandlerEnv,
    ) -> HandlerResult<StepOutput> {
        let packages = package_list(step);
        let path = step.get("path").and_then(Value::as_str);
        if packages.is_empty() && path.is_none() {
            return Err(HandlerError::InvalidStep {
                handler: "pip-install",
                reason: "either 'path' or 'packages' is required".to_string(),
            });
        }

        let wheels_dir = env
            .packages
            .local
            .wheels_dir
            .clone()
            .unwrap_or_else(|| DEFAULT_WHEELS_DIR.to_string());
        let source = resolve_source(&env.packages.mode, Path::new(&wheels_dir));
        debug!(mode = %env.packages.mode, ?source, wheels_dir, "resolved pip install source");

        let mut cmd = tokio::process::Command::new("pip");
        cmd.arg("install");
        if source == InstallSource::Local {
            cmd.args(["--no-index", "--find-links", &wheels_dir]);
        }
        if let Some(path) = path {
            let p = PathBuf::from(path);
            let resolved = if p.is_absolute() { p } else { env.workdir.join(p) };
            if resolved.is_dir() {
                cmd.arg(resolved);
            } else {
                cmd.arg("-r").arg(resolved);
            }
        }
        for package in &packages {
            cmd.arg(package);
        }
        cmd.current_dir(env.step_workdir(step));

        info!(packages = packages.len(), "pip install");
        run_with_deadline(cmd, env.step_timeout(step)).await
    }
}

pub struct NpmInstallHandler;

#[async_trait]
impl Handler for NpmInstallHandler {
    fn name(&self) -> &'static str {
        "npm-install"
    }

    async fn execute(
        &self,
        step: &Map<String, Value>,
        env: &HandlerEnv,
    ) -> HandlerResult<StepOutput> {
        let packages = package_list(step);
        let path = step.get("path").and_then(Value::as_str);

        let packages_dir = env
            .packages
            .local
            .packages_dir
            .clone()
            .unwrap_or_else(|| DEFAULT_PACKAGES_DIR.to_string());
        let source = resolve_source(&env.packages.mode, Path::new(&packages_dir));
        debug!(mode = %env.packages.mode, ?source, packages_dir, "resolved npm install source");

        let mut cmd = tokio::process::Command::new("npm");
        cmd.arg("install");
        // Install into the package at `path` when given, otherwise the
        // step's working directory.
        let target = match path {
            Some(p) => {
                let p = PathBuf::from(p);
                if p.is_absolute() {
                    p
                } else {
                    env.workdir.join(p)
                }
            }
            None => env.step_workdir(step),
        };
        cmd.current_dir(&target);

        for package in &packages {
            if source == InstallSource::Local {
                // A locally built tarball or directory wins over the
                // registry name when one exists.
                let local = Path::new(&packages_dir).join(package);
                if local.exists() {
                    cmd.arg(local);
                    continue;
                }
            }
            cmd.arg(package);
        }

        info!(packages = packages.len(), target = %target.display(), "npm install");
        run_with_deadline(cmd, env.step_timeout(step)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_source_explicit_modes() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_source("local", dir.path()), InstallSource::Local);
        assert_eq!(
            resolve_source("published", dir.path()),
            InstallSource::Registry
        );
    }

    #[test]
    fn test_resolve_source_auto_probes_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resolve_source("auto", dir.path()), InstallSource::Local);
        assert_eq!(
            resolve_source("auto", Path::new("/definitely/not/here")),
            InstallSource::Registry
        );
    }

    #[test]
    fn test_package_list_extraction() {
        let step: Map<String, Value> =
            serde_json::from_value(json!({"packages": ["requests", "pyyaml"]})).unwrap();
        assert_eq!(package_list(&step), vec!["requests", "pyyaml"]);
        assert!(package_list(&Map::new()).is_empty());
    }

    #[tokio::test]
    async fn test_pip_requires_path_or_packages() {
        let env = HandlerEnv::new(PathBuf::from("/suite"), std::env::temp_dir());
        let err = PipInstallHandler
            .execute(&Map::new(), &env)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("path"));
    }
}

//! Background API server management: detached spawn, pid/port files, stop.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use engine::paths::StateDirs;

/// Child processes started in background mode carry this marker.
pub const DETACHED_ENV: &str = "TSUITE_DETACHED";

/// True when this process is a detached child of the API launcher.
pub fn is_detached_child() -> bool {
    std::env::var(DETACHED_ENV).map(|v| v == "1").unwrap_or(false)
}

/// Respawn the CLI as a detached `api` server and return its pid.
pub fn spawn_detached(dirs: &StateDirs, port: u16) -> Result<u32> {
    dirs.ensure()?;
    let exe = std::env::current_exe().context("locating current executable")?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dirs.log_file())
        .context("opening server log")?;

    let child = std::process::Command::new(exe)
        .args(["api", "--port", &port.to_string()])
        .env(DETACHED_ENV, "1")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::from(log.try_clone()?))
        .stderr(std::process::Stdio::from(log))
        .spawn()
        .context("spawning detached api server")?;

    let pid = child.id();
    info!(pid, port, "api server detached");
    Ok(pid)
}

/// Stop a running API server via its pid file. Returns false when no
/// server appears to be running.
pub fn stop(dirs: &StateDirs) -> Result<bool> {
    let pid_file = dirs.pid_file();
    let Ok(text) = std::fs::read_to_string(&pid_file) else {
        return Ok(false);
    };
    let pid: u32 = text.trim().parse().context("pid file contents")?;

    let status = std::process::Command::new("kill")
        .arg(pid.to_string())
        .status()
        .context("invoking kill")?;

    let _ = std::fs::remove_file(&pid_file);
    let _ = std::fs::remove_file(dirs.port_file());
    info!(pid, stopped = status.success(), "api server stop requested");
    Ok(status.success())
}

/// Cap the server log so a long-lived install does not grow unbounded.
pub fn truncate_large_log(path: &Path, max_bytes: u64) {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() > max_bytes {
            let _ = std::fs::write(path, b"");
        }
    }
}

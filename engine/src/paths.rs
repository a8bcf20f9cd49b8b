//! Locations of persistent state under `~/.tsuite`.

use std::path::PathBuf;

/// State directory layout: database, server control files, and per-run
/// logs.
#[derive(Debug, Clone)]
pub struct StateDirs {
    root: PathBuf,
}

impl StateDirs {
    /// The default `~/.tsuite` layout, falling back to the current
    /// directory when no home is available.
    pub fn default_root() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            root: home.join(".tsuite"),
        }
    }

    /// A layout rooted elsewhere (tests, containers).
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("results.db")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.root.join("server.pid")
    }

    pub fn port_file(&self) -> PathBuf {
        self.root.join("server.port")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("server.log")
    }

    /// Per-test log directory for one run.
    pub fn run_log_dir(&self, run_id: &str, use_case: &str, test_case: &str) -> PathBuf {
        self.root
            .join("runs")
            .join(run_id)
            .join(use_case)
            .join(test_case)
    }
}

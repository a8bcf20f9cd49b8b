//! tsuite execution engine
//!
//! This library provides:
//! - YAML suite/test/routine loading with a typed-plus-raw config view
//! - `${…}` interpolation over a shared execution context and the
//!   assertion expression evaluator
//! - Step handlers (shell, wait, http, file, pip-install, npm-install)
//! - Comment-preserving YAML document editing
//! - The per-test runner with ordered phases and best-effort post-run
//! - Isolated execution strategies (host scratch directory or ephemeral
//!   container)
//! - SQLite persistence with idempotent counters
//! - The SSE event hub and the HTTP control service
//!
//! The `tsuite-runner` binary in this crate executes a single test inside
//! an isolated environment and reports progress back to the control
//! service.

pub mod client;
pub mod config;
pub mod contracts;
pub mod discovery;
pub mod events;
pub mod handlers;
pub mod interp;
pub mod paths;
pub mod runner;
pub mod sandbox;
pub mod server;
pub mod store;
pub mod yamldoc;

pub use client::{ControlClient, ClientError};
pub use config::{Phase, RoutineFile, StepSpec, SuiteConfig, TestSpec};
pub use contracts::{AssertionRecord, StepRecord, TestOutcome, TestPatch};
pub use discovery::{discover_filtered, discover_tests, DiscoveredTest, TestFilter};
pub use events::{EventHub, RunEvent, SharedEventHub};
pub use interp::Context;
pub use runner::{Reporter, Runner};
pub use sandbox::{strategy_for, ExecContext, ExecReport, ExecStrategy};
pub use store::{RunRecord, RunStatus, Store, TestStatus};

/// Crate version stamped on run rows.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

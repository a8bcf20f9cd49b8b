//! tsuite-runner — executes one test inside an isolated environment.
//!
//! Invoked by the isolation layer (directly on the host in standalone
//! mode, inside the container in docker mode). Logs go to stderr; the only
//! stdout output is the final outcome as one JSON line, which the parent
//! parses. Exit code 0 means the test passed.

use std::path::PathBuf;

use clap::Parser;
use tracing::error;

use engine::runner::{Reporter, Runner};
use engine::ControlClient;

#[derive(Parser)]
#[command(name = "tsuite-runner")]
#[command(about = "Run a single tsuite test in the current environment", long_about = None)]
struct Args {
    /// Suite directory containing config.yaml
    #[arg(long)]
    suite_path: PathBuf,

    /// Test to run, as use_case/test_case
    #[arg(long)]
    test_id: String,

    /// Scratch working directory for this test
    #[arg(long)]
    workdir: PathBuf,

    /// Control service base URL for progress reporting
    #[arg(long)]
    server_url: Option<String>,

    /// Run this test belongs to
    #[arg(long)]
    run_id: Option<String>,
}

#[tokio::main]
async fn main() {
    // Keep stdout clean for the outcome line.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut runner = match Runner::new(&args.suite_path, &args.workdir) {
        Ok(runner) => runner,
        Err(e) => {
            error!(error = %e, "failed to initialize runner");
            std::process::exit(1);
        }
    };

    let server_url = args.server_url.as_deref().filter(|u| !u.is_empty());
    let run_id = args.run_id.as_deref().filter(|r| !r.is_empty());
    if let (Some(url), Some(run_id)) = (server_url, run_id) {
        runner = runner.with_reporter(Reporter {
            client: ControlClient::new(url),
            run_id: run_id.to_string(),
        });
    }

    let outcome = match runner.run_test(&args.test_id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(test_id = %args.test_id, error = %e, "test execution failed");
            std::process::exit(1);
        }
    };

    match serde_json::to_string(&outcome) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            error!(error = %e, "failed to serialize outcome");
            std::process::exit(1);
        }
    }

    std::process::exit(if outcome.passed { 0 } else { 1 });
}

//! tsuite — YAML-driven integration test orchestrator.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use engine::discovery::{self, TestFilter};
use engine::events::EventHub;
use engine::paths::StateDirs;
use engine::server::{self, AppState};
use engine::store::Store;

use tsuite::detach;
use tsuite::orchestrator::{self, RunOptions};

/// Server log files larger than this are truncated at startup.
const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;

const DEFAULT_API_PORT: u16 = 8787;

#[derive(Parser)]
#[command(name = "tsuite")]
#[command(about = "YAML-driven integration test orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute tests from a suite
    Run {
        /// Suite directory containing config.yaml
        #[arg(long, default_value = ".")]
        suite_path: PathBuf,

        /// Worker count, overriding execution.max_workers
        #[arg(long)]
        parallel: Option<usize>,

        /// Restrict to these use cases
        #[arg(long)]
        uc: Vec<String>,

        /// Restrict to these test cases (tcNN or uc/tc)
        #[arg(long)]
        tc: Vec<String>,

        /// Restrict to tests carrying any of these tags
        #[arg(long)]
        tags: Vec<String>,

        /// Resolve the schedule and print it without executing
        #[arg(long, default_value = "false")]
        dry_run: bool,

        /// Control service to report to; when absent an embedded service
        /// is started for the duration of the run
        #[arg(long)]
        api_url: Option<String>,

        /// Path to the tsuite-runner binary
        #[arg(long)]
        runner_path: Option<PathBuf>,

        /// Display name for the run
        #[arg(long)]
        name: Option<String>,
    },

    /// List tests a filter would select
    List {
        #[arg(long, default_value = ".")]
        suite_path: PathBuf,
        #[arg(long)]
        uc: Vec<String>,
        #[arg(long)]
        tc: Vec<String>,
        #[arg(long)]
        tags: Vec<String>,
    },

    /// Serve the HTTP control plane
    Api {
        #[arg(long, default_value_t = DEFAULT_API_PORT)]
        port: u16,

        /// Fork into the background and return immediately
        #[arg(long, default_value = "false")]
        detach: bool,
    },

    /// Stop a background API server
    Stop,

    /// Validate a suite without executing anything
    Check {
        #[arg(long, default_value = ".")]
        suite_path: PathBuf,
    },

    /// Delete persisted runs
    Clear {
        /// Delete only this run
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Print the version
    Version,
}

fn filter_from(uc: Vec<String>, tc: Vec<String>, tags: Vec<String>) -> TestFilter {
    TestFilter {
        use_cases: uc.into_iter().collect::<BTreeSet<_>>(),
        test_cases: tc.into_iter().collect::<BTreeSet<_>>(),
        tags: tags.into_iter().collect::<BTreeSet<_>>(),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    std::process::exit(exit);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let dirs = StateDirs::default_root();

    match cli.command {
        Commands::Run {
            suite_path,
            parallel,
            uc,
            tc,
            tags,
            dry_run,
            api_url,
            runner_path,
            name,
        } => {
            let filter = filter_from(uc, tc, tags);

            if dry_run {
                let tests = discovery::discover_filtered(&suite_path, &filter);
                println!("{} test(s) would run:", tests.len());
                for test in &tests {
                    println!("  {}  {}", test.test_id, test.name);
                }
                return Ok(0);
            }

            // No external service given: bring one up for this run so the
            // full reporting path is exercised either way.
            let api_url = match api_url {
                Some(url) => url,
                None => start_embedded_service(&dirs).await?,
            };

            let summary = orchestrator::execute(RunOptions {
                suite_path,
                api_url,
                filter,
                parallel,
                display_name: name,
                runner_path,
                state_dirs: dirs,
            })
            .await?;

            println!(
                "run {}: {} passed, {} failed, {} skipped ({} total){}",
                summary.run_id,
                summary.passed,
                summary.failed,
                summary.skipped,
                summary.total,
                if summary.cancelled { " [cancelled]" } else { "" }
            );
            Ok(if summary.all_passed() { 0 } else { 1 })
        }

        Commands::List {
            suite_path,
            uc,
            tc,
            tags,
        } => {
            let filter = filter_from(uc, tc, tags);
            let tests = discovery::discover_filtered(&suite_path, &filter);
            for test in &tests {
                let tags = if test.tags.is_empty() {
                    String::new()
                } else {
                    format!("  [{}]", test.tags.join(", "))
                };
                println!("{}  {}{}", test.test_id, test.name, tags);
            }
            println!("{} test(s)", tests.len());
            Ok(0)
        }

        Commands::Api { port, detach: fork } => {
            if fork && !detach::is_detached_child() {
                let pid = detach::spawn_detached(&dirs, port)?;
                println!("api server started in background (pid {pid}, port {port})");
                return Ok(0);
            }
            if detach::is_detached_child() {
                detach::truncate_large_log(&dirs.log_file(), MAX_LOG_BYTES);
            }
            serve_api(&dirs, port).await?;
            Ok(0)
        }

        Commands::Stop => {
            if detach::stop(&dirs)? {
                println!("api server stopped");
            } else {
                println!("no api server running");
            }
            Ok(0)
        }

        Commands::Check { suite_path } => {
            let problems = discovery::check_suite(&suite_path)?;
            if problems.is_empty() {
                println!("suite ok");
                Ok(0)
            } else {
                for problem in &problems {
                    println!("problem: {problem}");
                }
                Ok(1)
            }
        }

        Commands::Clear { run_id } => {
            let store = Store::open(&dirs.db_path()).await?;
            match run_id {
                Some(run_id) => {
                    store.delete_run(&run_id).await?;
                    println!("deleted run {run_id}");
                }
                None => {
                    let runs = store.list_runs(i64::MAX).await?;
                    for run in &runs {
                        store.delete_run(&run.run_id).await?;
                    }
                    println!("deleted {} run(s)", runs.len());
                }
            }
            Ok(0)
        }

        Commands::Version => {
            println!("tsuite {}", engine::VERSION);
            Ok(0)
        }
    }
}

async fn app_state(dirs: &StateDirs) -> Result<AppState> {
    dirs.ensure()?;
    let store = Store::open(&dirs.db_path()).await?;
    Ok(AppState {
        store: Arc::new(store),
        hub: EventHub::new().shared(),
        dirs: dirs.clone(),
        orchestrator_binary: std::env::current_exe().context("locating current executable")?,
        public_url: String::new(),
    })
}

/// Foreground API server with pid/port files.
async fn serve_api(dirs: &StateDirs, port: u16) -> Result<()> {
    let state = app_state(dirs).await?;
    server::serve(state, port).await
}

/// Ephemeral in-process control service for a single CLI run.
async fn start_embedded_service(dirs: &StateDirs) -> Result<String> {
    let state = app_state(dirs).await?;
    let url = server::spawn_ephemeral(state).await?;
    info!(url, "embedded control service ready");
    Ok(url)
}

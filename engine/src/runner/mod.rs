//! The per-test runner: drives one test through its phases.
//!
//! Phases run in order: pre-run, test, post-run. A pre-run failure aborts
//! the whole test (the test phase never starts); a test-phase failure skips
//! the assertions; post-run always runs to completion with every step
//! treated as `ignore_errors`. Assertions are evaluated only after a clean
//! test phase.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::ControlClient;
use crate::config::{
    ConfigError, Phase, Routine, RoutineFile, StepKind, StepSpec, SuiteConfig, TestSpec,
};
use crate::contracts::{AssertionRecord, StepRecord, TestOutcome, TestPatch};
use crate::handlers::{HandlerEnv, HandlerRegistry};
use crate::interp::{eval, Context};

/// Routine calls nested deeper than this fail the step; routines are
/// reusable sequences, not a programming language.
const MAX_ROUTINE_DEPTH: usize = 8;

/// Error type for runner setup
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid test id '{0}': expected use_case/test_case")]
    InvalidTestId(String),
}

/// Result type for runner setup
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Progress reporting target for one test execution.
#[derive(Debug, Clone)]
pub struct Reporter {
    pub client: ControlClient,
    pub run_id: String,
}

/// Executes tests of one suite inside a prepared working directory.
pub struct Runner {
    suite_path: PathBuf,
    workdir: PathBuf,
    config: SuiteConfig,
    registry: HandlerRegistry,
    global_routines: RoutineFile,
    reporter: Option<Reporter>,
}

struct PhaseFailure {
    error: String,
    error_step: String,
}

impl Runner {
    /// Build a runner for a suite. Loads the suite config and the global
    /// routine library.
    pub fn new(suite_path: &Path, workdir: &Path) -> RunnerResult<Self> {
        let config = SuiteConfig::load(suite_path)?;
        let global_routines = RoutineFile::load(&suite_path.join("global/routines.yaml"))?;
        Ok(Self {
            suite_path: suite_path.to_path_buf(),
            workdir: workdir.to_path_buf(),
            config,
            registry: HandlerRegistry::builtin(),
            global_routines,
            reporter: None,
        })
    }

    /// Report step progress to a control service while running.
    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    /// Run one test to completion and return its outcome.
    pub async fn run_test(&self, test_id: &str) -> RunnerResult<TestOutcome> {
        let (use_case, test_case) = test_id
            .split_once('/')
            .ok_or_else(|| RunnerError::InvalidTestId(test_id.to_string()))?;

        let test_dir = self.suite_path.join("suites").join(use_case).join(test_case);
        let spec = TestSpec::load(&test_dir.join("test.yaml"))?;
        let uc_routines =
            RoutineFile::load(&self.suite_path.join("suites").join(use_case).join("routines.yaml"))?;

        let artifacts = test_dir.join("artifacts");
        let uc_artifacts = self.suite_path.join("suites").join(use_case).join("artifacts");
        let mut ctx = Context::for_test(
            self.config.raw().clone(),
            &self.suite_path,
            &self.workdir,
            &artifacts,
            &uc_artifacts,
            test_id,
            use_case,
            test_case,
        );

        let mut handler_env = HandlerEnv::new(self.suite_path.clone(), self.workdir.clone());
        handler_env.packages = self.config.packages.clone();
        if let Some(timeout) = self.config.defaults.timeout {
            handler_env.default_timeout = timeout;
        }

        info!(test_id, name = %spec.name, "test started");
        let started = Instant::now();
        let mut steps: Vec<StepRecord> = Vec::new();
        let mut failure: Option<PhaseFailure> = None;

        // pre-run: a failure aborts the whole test.
        if let Some(f) = self
            .run_phase(Phase::PreRun, &spec, &uc_routines, &mut ctx, &handler_env, &mut steps, test_id)
            .await
        {
            failure = Some(f);
        }

        // test phase only runs after a clean pre-run.
        if failure.is_none() {
            if let Some(f) = self
                .run_phase(Phase::Test, &spec, &uc_routines, &mut ctx, &handler_env, &mut steps, test_id)
                .await
            {
                failure = Some(f);
            }
        }

        // Assertions run only when every step so far has passed.
        let mut assertions = Vec::new();
        if failure.is_none() {
            for (index, assertion) in spec.assertions.iter().enumerate() {
                let result = eval::evaluate(&ctx, &assertion.expression, assertion.message.as_deref());
                debug!(
                    test_id,
                    index,
                    passed = result.passed,
                    expression = %assertion.expression,
                    "assertion evaluated"
                );
                if !result.passed && failure.is_none() {
                    failure = Some(PhaseFailure {
                        error: if result.message.is_empty() {
                            format!("assertion {index} failed: {}", assertion.expression)
                        } else {
                            result.message.clone()
                        },
                        error_step: format!("assertion[{index}]"),
                    });
                }
                assertions.push(AssertionRecord::from_eval(
                    index,
                    &assertion.expression,
                    assertion.message.as_deref(),
                    &result,
                ));
            }
        }

        // post-run always runs; its failures are recorded but never fail
        // the test.
        self.run_phase(Phase::PostRun, &spec, &uc_routines, &mut ctx, &handler_env, &mut steps, test_id)
            .await;

        let captured: BTreeMap<String, String> = ctx
            .captured
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()),
                )
            })
            .collect();

        let duration_ms = started.elapsed().as_millis() as i64;
        let outcome = TestOutcome {
            test_id: test_id.to_string(),
            passed: failure.is_none(),
            error: failure.as_ref().map(|f| f.error.clone()),
            error_step: failure.as_ref().map(|f| f.error_step.clone()),
            duration_ms,
            steps,
            assertions,
            captured,
        };
        info!(test_id, passed = outcome.passed, duration_ms, "test finished");
        Ok(outcome)
    }

    /// Run all steps of one phase. Returns the failure that aborted it, if
    /// any. Post-run never aborts: every step there is treated as
    /// `ignore_errors`.
    #[allow(clippy::too_many_arguments)]
    async fn run_phase(
        &self,
        phase: Phase,
        spec: &TestSpec,
        uc_routines: &RoutineFile,
        ctx: &mut Context,
        handler_env: &HandlerEnv,
        records: &mut Vec<StepRecord>,
        test_id: &str,
    ) -> Option<PhaseFailure> {
        let mut index = 0usize;
        self.run_steps(
            phase,
            spec.phase_steps(phase),
            uc_routines,
            ctx,
            handler_env,
            records,
            &mut index,
            test_id,
            0,
        )
        .await
    }

    /// Execute a step sequence, expanding routine calls in place. `index`
    /// numbers the flattened steps within the phase.
    #[allow(clippy::too_many_arguments)]
    async fn run_steps(
        &self,
        phase: Phase,
        steps: &[StepSpec],
        uc_routines: &RoutineFile,
        ctx: &mut Context,
        handler_env: &HandlerEnv,
        records: &mut Vec<StepRecord>,
        index: &mut usize,
        test_id: &str,
        depth: usize,
    ) -> Option<PhaseFailure> {
        // Boxed for recursion through routine expansion.
        for step in steps {
            match step.kind() {
                Some(StepKind::Routine(name)) => {
                    let resolved = self.resolve_routine(name, uc_routines);
                    let Some(routine) = resolved else {
                        let record = self.synthetic_failure(
                            phase,
                            *index,
                            step,
                            format!("unknown routine '{name}'"),
                        );
                        let failure = PhaseFailure {
                            error: record.error.clone().unwrap_or_default(),
                            error_step: record.locator(),
                        };
                        self.record_step(records, record, test_id).await;
                        *index += 1;
                        if phase != Phase::PostRun && !step.ignore_errors {
                            return Some(failure);
                        }
                        continue;
                    };

                    if depth >= MAX_ROUTINE_DEPTH {
                        let record = self.synthetic_failure(
                            phase,
                            *index,
                            step,
                            format!("routine '{name}' nested deeper than {MAX_ROUTINE_DEPTH}"),
                        );
                        let failure = PhaseFailure {
                            error: record.error.clone().unwrap_or_default(),
                            error_step: record.locator(),
                        };
                        self.record_step(records, record, test_id).await;
                        *index += 1;
                        if phase != Phase::PostRun && !step.ignore_errors {
                            return Some(failure);
                        }
                        continue;
                    }

                    debug!(test_id, routine = name, depth, "entering routine");
                    // Interpolate the call's parameters with the caller's
                    // context, then shadow `params` for the routine body.
                    // config/state/captured/steps/last stay shared, so
                    // mutations inside the routine remain visible after it
                    // returns.
                    let bound = ctx.resolve_value(&Value::Object(step.params.clone()));
                    let saved_params = std::mem::take(&mut ctx.params);
                    if let Value::Object(map) = bound {
                        ctx.params = map;
                    }

                    let result = Box::pin(self.run_steps(
                        phase,
                        &routine.steps,
                        uc_routines,
                        ctx,
                        handler_env,
                        records,
                        index,
                        test_id,
                        depth + 1,
                    ))
                    .await;

                    ctx.params = saved_params;

                    if let Some(failure) = result {
                        if phase != Phase::PostRun && !step.ignore_errors {
                            return Some(failure);
                        }
                    }
                }
                Some(StepKind::Handler(handler_name)) => {
                    let failure = self
                        .run_handler_step(phase, step, handler_name, ctx, handler_env, records, index, test_id)
                        .await;
                    if let Some(failure) = failure {
                        if phase != Phase::PostRun {
                            return Some(failure);
                        }
                    }
                }
                None => {
                    let record = self.synthetic_failure(
                        phase,
                        *index,
                        step,
                        "step has neither handler nor routine".to_string(),
                    );
                    let failure = PhaseFailure {
                        error: record.error.clone().unwrap_or_default(),
                        error_step: record.locator(),
                    };
                    self.record_step(records, record, test_id).await;
                    *index += 1;
                    if phase != Phase::PostRun && !step.ignore_errors {
                        return Some(failure);
                    }
                }
            }
        }
        None
    }

    /// Execute one handler step: interpolate, dispatch, record, update the
    /// context. Returns the failure when the step should abort its phase.
    #[allow(clippy::too_many_arguments)]
    async fn run_handler_step(
        &self,
        phase: Phase,
        step: &StepSpec,
        handler_name: &str,
        ctx: &mut Context,
        handler_env: &HandlerEnv,
        records: &mut Vec<StepRecord>,
        index: &mut usize,
        test_id: &str,
    ) -> Option<PhaseFailure> {
        // Post-run steps never fail the test.
        let ignore_errors = step.ignore_errors || phase == Phase::PostRun;

        let interpolated = match ctx.resolve_value(&Value::Object(step.to_map())) {
            Value::Object(map) => map,
            _ => step.to_map(),
        };

        let started_at = Utc::now().timestamp_millis();
        let started = Instant::now();
        debug!(test_id, %phase, index = *index, handler = handler_name, "step started");

        let dispatched = self
            .registry
            .dispatch(handler_name, &interpolated, ignore_errors, handler_env)
            .await;

        let finished_at = Utc::now().timestamp_millis();
        let duration_ms = started.elapsed().as_millis() as i64;

        let (status, output, error) = match dispatched {
            Ok(output) => {
                let status = if output.success { "passed" } else { "failed" };
                let error = output.error.clone();
                (status, output, error)
            }
            Err(e) => {
                warn!(test_id, %phase, index = *index, error = %e, "step crashed");
                (
                    "crashed",
                    crate::handlers::StepOutput::default(),
                    Some(e.to_string()),
                )
            }
        };

        let record = StepRecord {
            phase,
            index: *index,
            handler: handler_name.to_string(),
            description: step.label(),
            status: status.to_string(),
            started_at,
            finished_at,
            duration_ms,
            exit_code: output.exit_code,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
            error: error.clone(),
        };

        // Context updates happen for every step, failed ones included, so
        // post-run and diagnostics can reference them.
        ctx.set_last(output.exit_code.unwrap_or(-1), &output.stdout, &output.stderr);
        if let Some(capture) = &step.capture {
            let result_value = serde_json::to_value(&record).unwrap_or(Value::Null);
            ctx.capture(capture, result_value, &output.stdout);
        }

        let failed = status != "passed" && !ignore_errors;
        let failure = failed.then(|| PhaseFailure {
            error: error.unwrap_or_else(|| format!("step {} failed", record.locator())),
            error_step: record.locator(),
        });

        self.record_step(records, record, test_id).await;
        *index += 1;
        failure
    }

    fn resolve_routine<'a>(&'a self, name: &str, uc_routines: &'a RoutineFile) -> Option<&'a Routine> {
        // `global.x` pins the global table; bare names resolve use-case
        // first, then global.
        if let Some(bare) = name.strip_prefix("global.") {
            self.global_routines.get(bare)
        } else {
            uc_routines.get(name).or_else(|| self.global_routines.get(name))
        }
    }

    fn synthetic_failure(
        &self,
        phase: Phase,
        index: usize,
        step: &StepSpec,
        error: String,
    ) -> StepRecord {
        let now = Utc::now().timestamp_millis();
        StepRecord {
            phase,
            index,
            handler: step.routine.clone().unwrap_or_default(),
            description: step.label(),
            status: "failed".to_string(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(error),
        }
    }

    /// Append a record and report it to the control service, best effort.
    async fn record_step(&self, records: &mut Vec<StepRecord>, record: StepRecord, test_id: &str) {
        if let Some(reporter) = &self.reporter {
            let patch = TestPatch {
                steps: vec![record.clone()],
                ..Default::default()
            };
            reporter
                .client
                .patch_test_best_effort(&reporter.run_id, test_id, &patch)
                .await;
        }
        records.push(record);
    }
}

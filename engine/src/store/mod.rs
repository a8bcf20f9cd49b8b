//! SQLite persistence for suites, runs, and their results.
//!
//! The database is opened in WAL mode with a long busy timeout: many
//! readers, one writer at a time. Run counters are maintained incrementally
//! on each status transition: multiple workers report concurrently, and a
//! full recount on every update would race. Terminal test statuses are
//! frozen; later updates are acknowledged but ignored.

mod schema;
mod types;

pub use types::{
    AssertionResultRecord, CapturedValueRecord, RunRecord, RunStatus, StepResultRecord,
    SuiteRecord, TestResultRecord, TestStatus, TestUpdate, UpdateOutcome,
};

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("suite not found: {0}")]
    SuiteNotFound(String),

    #[error("test not found: {0} in run {1}")]
    TestNotFound(String, String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A test scheduled into a run before execution begins.
#[derive(Debug, Clone)]
pub struct PendingTest {
    pub test_id: String,
    pub use_case: String,
    pub test_case: String,
    pub name: String,
    pub tags: Vec<String>,
}

/// SQLite-backed store
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (or create) the database at `path` with WAL journaling and a
    /// 30s busy timeout.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        for statement in schema::SCHEMA.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&self.pool).await?;
            }
        }
        sqlx::query("INSERT OR IGNORE INTO schema_version (id, version) VALUES (1, ?1)")
            .bind(schema::SCHEMA_VERSION)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The stored schema version.
    pub async fn schema_version(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT version FROM schema_version WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("version"))
    }

    // =========================================================================
    // Suites
    // =========================================================================

    /// Register a suite, or refresh an existing registration for the same
    /// folder path.
    pub async fn upsert_suite(
        &self,
        folder_path: &str,
        name: &str,
        mode: &str,
        config_json: &str,
        test_count: i64,
    ) -> StoreResult<SuiteRecord> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO suites (folder_path, name, mode, config_json, test_count, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(folder_path) DO UPDATE SET
                name = excluded.name,
                mode = excluded.mode,
                config_json = excluded.config_json,
                test_count = excluded.test_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(folder_path)
        .bind(name)
        .bind(mode)
        .bind(config_json)
        .bind(test_count)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_suite_by_path(folder_path).await
    }

    pub async fn get_suite(&self, id: i64) -> StoreResult<SuiteRecord> {
        let row = sqlx::query("SELECT * FROM suites WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::SuiteNotFound(id.to_string()))?;
        Ok(suite_from_row(&row))
    }

    pub async fn get_suite_by_path(&self, folder_path: &str) -> StoreResult<SuiteRecord> {
        let row = sqlx::query("SELECT * FROM suites WHERE folder_path = ?1")
            .bind(folder_path)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::SuiteNotFound(folder_path.to_string()))?;
        Ok(suite_from_row(&row))
    }

    pub async fn list_suites(&self) -> StoreResult<Vec<SuiteRecord>> {
        let rows = sqlx::query("SELECT * FROM suites ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(suite_from_row).collect())
    }

    pub async fn delete_suite(&self, id: i64) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM suites WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::SuiteNotFound(id.to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Create a run and pre-register every scheduled test as pending.
    pub async fn create_run(
        &self,
        run_id: &str,
        suite_id: Option<i64>,
        display_name: &str,
        mode: &str,
        version: &str,
        tests: &[PendingTest],
    ) -> StoreResult<RunRecord> {
        let now = Utc::now().timestamp_millis();
        let total = tests.len() as i64;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO runs (run_id, suite_id, display_name, started_at, status, mode,
                              total_tests, pending_count, version)
            VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6, ?6, ?7)
            "#,
        )
        .bind(run_id)
        .bind(suite_id)
        .bind(display_name)
        .bind(now)
        .bind(mode)
        .bind(total)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        for test in tests {
            let tags = serde_json::to_string(&test.tags).unwrap_or_else(|_| "[]".into());
            sqlx::query(
                r#"
                INSERT INTO test_results (run_id, test_id, use_case, test_case, name, tags, status)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending')
                "#,
            )
            .bind(run_id)
            .bind(&test.test_id)
            .bind(&test.use_case)
            .bind(&test.test_case)
            .bind(&test.name)
            .bind(tags)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(run_id, total, "run created");
        self.get_run(run_id).await
    }

    pub async fn get_run(&self, run_id: &str) -> StoreResult<RunRecord> {
        let row = sqlx::query("SELECT * FROM runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::RunNotFound(run_id.to_string()))?;
        Ok(run_from_row(&row))
    }

    pub async fn list_runs(&self, limit: i64) -> StoreResult<Vec<RunRecord>> {
        let rows = sqlx::query("SELECT * FROM runs ORDER BY started_at DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(run_from_row).collect())
    }

    /// Flag a run for cooperative cancellation. Returns false when the run
    /// is already terminal.
    pub async fn request_cancel(&self, run_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE runs SET cancel_requested = 1
             WHERE run_id = ?1 AND status IN ('pending', 'running')",
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Finish a run: terminal status from the failure tally, wall-clock
    /// duration from timestamps.
    pub async fn complete_run(&self, run_id: &str) -> StoreResult<RunRecord> {
        let run = self.get_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        let now = Utc::now().timestamp_millis();
        let status = if run.failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        sqlx::query(
            "UPDATE runs SET status = ?1, finished_at = ?2, duration_ms = ?2 - started_at
             WHERE run_id = ?3",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        self.get_run(run_id).await
    }

    /// Cancel a run: every pending or running test becomes skipped, the
    /// skipped bucket is recounted, and the run reaches `cancelled` with
    /// its wall-clock duration. Runs in one transaction, the only
    /// multi-statement transaction any caller holds.
    pub async fn mark_cancelled(&self, run_id: &str) -> StoreResult<RunRecord> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE test_results
            SET status = 'skipped', error_message = 'Run cancelled', finished_at = ?1
            WHERE run_id = ?2 AND status IN ('pending', 'running')
            "#,
        )
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            r#"
            UPDATE runs SET
                pending_count = 0,
                running_count = 0,
                skipped = (SELECT COUNT(*) FROM test_results
                           WHERE run_id = ?1 AND status = 'skipped'),
                status = 'cancelled',
                cancel_requested = 1,
                finished_at = ?2,
                duration_ms = ?2 - started_at
            WHERE run_id = ?1
            "#,
        )
        .bind(run_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }

        tx.commit().await?;
        info!(run_id, "run cancelled");
        self.get_run(run_id).await
    }

    /// Delete a run; results cascade away with it.
    pub async fn delete_run(&self, run_id: &str) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM runs WHERE run_id = ?1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    /// Administrative repair: recount every bucket from the test rows.
    pub async fn recompute_counters(&self, run_id: &str) -> StoreResult<RunRecord> {
        sqlx::query(
            r#"
            UPDATE runs SET
                pending_count = (SELECT COUNT(*) FROM test_results WHERE run_id = ?1 AND status = 'pending'),
                running_count = (SELECT COUNT(*) FROM test_results WHERE run_id = ?1 AND status = 'running'),
                passed = (SELECT COUNT(*) FROM test_results WHERE run_id = ?1 AND status = 'passed'),
                failed = (SELECT COUNT(*) FROM test_results WHERE run_id = ?1 AND status IN ('failed', 'crashed')),
                skipped = (SELECT COUNT(*) FROM test_results WHERE run_id = ?1 AND status = 'skipped')
            WHERE run_id = ?1
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        self.get_run(run_id).await
    }

    // =========================================================================
    // Test results
    // =========================================================================

    /// Apply a status update to one test, idempotently.
    ///
    /// A test already in a terminal status is left untouched and the call
    /// reports `skipped = true, reason = "already terminal"`. Counter
    /// buckets move incrementally with the transition.
    pub async fn update_test(
        &self,
        run_id: &str,
        test_id: &str,
        update: &TestUpdate,
    ) -> StoreResult<UpdateOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT id, status FROM test_results WHERE run_id = ?1 AND test_id = ?2")
            .bind(run_id)
            .bind(test_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::TestNotFound(test_id.to_string(), run_id.to_string()))?;
        let current = TestStatus::parse(&row.get::<String, _>("status"));

        if current.is_terminal() {
            debug!(run_id, test_id, status = current.as_str(), "update ignored");
            return Ok(UpdateOutcome::already_terminal());
        }

        sqlx::query(
            r#"
            UPDATE test_results SET
                status = COALESCE(?1, status),
                started_at = COALESCE(?2, started_at),
                finished_at = COALESCE(?3, finished_at),
                duration_ms = COALESCE(?4, duration_ms),
                error_message = COALESCE(?5, error_message),
                error_step = COALESCE(?6, error_step),
                steps_passed = COALESCE(?7, steps_passed),
                steps_failed = COALESCE(?8, steps_failed),
                steps_json = COALESCE(?9, steps_json)
            WHERE run_id = ?10 AND test_id = ?11
            "#,
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.started_at)
        .bind(update.finished_at)
        .bind(update.duration_ms)
        .bind(update.error_message.as_deref())
        .bind(update.error_step.as_deref())
        .bind(update.steps_passed)
        .bind(update.steps_failed)
        .bind(update.steps_json.as_deref())
        .bind(run_id)
        .bind(test_id)
        .execute(&mut *tx)
        .await?;

        // Move the counter from the old bucket to the new one.
        if let Some(new_status) = update.status {
            if new_status != current {
                let old = current.bucket();
                let new = new_status.bucket();
                if old != new {
                    let sql =
                        format!("UPDATE runs SET {old} = {old} - 1, {new} = {new} + 1 WHERE run_id = ?1");
                    sqlx::query(&sql).bind(run_id).execute(&mut *tx).await?;
                }
            }
        }

        tx.commit().await?;
        Ok(UpdateOutcome::applied())
    }

    pub async fn get_test_result(
        &self,
        run_id: &str,
        test_id: &str,
    ) -> StoreResult<TestResultRecord> {
        let row = sqlx::query("SELECT * FROM test_results WHERE run_id = ?1 AND test_id = ?2")
            .bind(run_id)
            .bind(test_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::TestNotFound(test_id.to_string(), run_id.to_string()))?;
        Ok(test_from_row(&row))
    }

    pub async fn list_test_results(&self, run_id: &str) -> StoreResult<Vec<TestResultRecord>> {
        let rows = sqlx::query("SELECT * FROM test_results WHERE run_id = ?1 ORDER BY test_id")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(test_from_row).collect())
    }

    // =========================================================================
    // Step / assertion / capture rows (append-only within a run)
    // =========================================================================

    pub async fn add_step_result(
        &self,
        test_result_id: i64,
        step: &StepResultRecord,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO step_results
                (test_result_id, step_index, phase, handler, description, status,
                 started_at, finished_at, duration_ms, exit_code, stdout, stderr, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(test_result_id)
        .bind(step.step_index)
        .bind(&step.phase)
        .bind(&step.handler)
        .bind(&step.description)
        .bind(&step.status)
        .bind(step.started_at)
        .bind(step.finished_at)
        .bind(step.duration_ms)
        .bind(step.exit_code)
        .bind(&step.stdout)
        .bind(&step.stderr)
        .bind(step.error_message.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_step_results(
        &self,
        test_result_id: i64,
    ) -> StoreResult<Vec<StepResultRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM step_results WHERE test_result_id = ?1 ORDER BY id",
        )
        .bind(test_result_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| StepResultRecord {
                id: row.get("id"),
                test_result_id: row.get("test_result_id"),
                step_index: row.get("step_index"),
                phase: row.get("phase"),
                handler: row.get("handler"),
                description: row.get("description"),
                status: row.get("status"),
                started_at: row.get("started_at"),
                finished_at: row.get("finished_at"),
                duration_ms: row.get("duration_ms"),
                exit_code: row.get("exit_code"),
                stdout: row.get("stdout"),
                stderr: row.get("stderr"),
                error_message: row.get("error_message"),
            })
            .collect())
    }

    pub async fn add_assertion_result(
        &self,
        test_result_id: i64,
        assertion: &AssertionResultRecord,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO assertion_results
                (test_result_id, assertion_index, expression, message, passed,
                 actual_value, expected_value)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(test_result_id)
        .bind(assertion.assertion_index)
        .bind(&assertion.expression)
        .bind(assertion.message.as_deref())
        .bind(assertion.passed)
        .bind(&assertion.actual_value)
        .bind(&assertion.expected_value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_assertion_results(
        &self,
        test_result_id: i64,
    ) -> StoreResult<Vec<AssertionResultRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM assertion_results WHERE test_result_id = ?1 ORDER BY assertion_index",
        )
        .bind(test_result_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| AssertionResultRecord {
                id: row.get("id"),
                test_result_id: row.get("test_result_id"),
                assertion_index: row.get("assertion_index"),
                expression: row.get("expression"),
                message: row.get("message"),
                passed: row.get::<i64, _>("passed") != 0,
                actual_value: row.get("actual_value"),
                expected_value: row.get("expected_value"),
            })
            .collect())
    }

    pub async fn add_captured_value(
        &self,
        test_result_id: i64,
        key: &str,
        value: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO captured_values (test_result_id, key, value, captured_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(test_result_id)
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_captured_values(
        &self,
        test_result_id: i64,
    ) -> StoreResult<Vec<CapturedValueRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM captured_values WHERE test_result_id = ?1 ORDER BY key",
        )
        .bind(test_result_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| CapturedValueRecord {
                id: row.get("id"),
                test_result_id: row.get("test_result_id"),
                key: row.get("key"),
                value: row.get("value"),
                captured_at: row.get("captured_at"),
            })
            .collect())
    }
}

fn suite_from_row(row: &sqlx::sqlite::SqliteRow) -> SuiteRecord {
    SuiteRecord {
        id: row.get("id"),
        folder_path: row.get("folder_path"),
        name: row.get("name"),
        mode: row.get("mode"),
        config_json: row.get("config_json"),
        test_count: row.get("test_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> RunRecord {
    RunRecord {
        run_id: row.get("run_id"),
        suite_id: row.get("suite_id"),
        display_name: row.get("display_name"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        status: RunStatus::parse(&row.get::<String, _>("status")),
        mode: row.get("mode"),
        total_tests: row.get("total_tests"),
        pending_count: row.get("pending_count"),
        running_count: row.get("running_count"),
        passed: row.get("passed"),
        failed: row.get("failed"),
        skipped: row.get("skipped"),
        duration_ms: row.get("duration_ms"),
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        version: row.get("version"),
    }
}

fn test_from_row(row: &sqlx::sqlite::SqliteRow) -> TestResultRecord {
    TestResultRecord {
        id: row.get("id"),
        run_id: row.get("run_id"),
        test_id: row.get("test_id"),
        use_case: row.get("use_case"),
        test_case: row.get("test_case"),
        name: row.get("name"),
        tags: row.get("tags"),
        status: TestStatus::parse(&row.get::<String, _>("status")),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        duration_ms: row.get("duration_ms"),
        error_message: row.get("error_message"),
        error_step: row.get("error_step"),
        steps_passed: row.get("steps_passed"),
        steps_failed: row.get("steps_failed"),
        steps_json: row.get("steps_json"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestStore {
        store: Store,
        _dir: TempDir,
    }

    async fn open_store() -> TestStore {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("results.db")).await.unwrap();
        TestStore { store, _dir: dir }
    }

    fn pending(test_id: &str) -> PendingTest {
        let (uc, tc) = test_id.split_once('/').unwrap();
        PendingTest {
            test_id: test_id.to_string(),
            use_case: uc.to_string(),
            test_case: tc.to_string(),
            name: test_id.to_string(),
            tags: vec!["smoke".into()],
        }
    }

    async fn seed_run(store: &Store, run_id: &str, tests: &[&str]) -> RunRecord {
        let pending: Vec<PendingTest> = tests.iter().map(|t| pending(t)).collect();
        store
            .create_run(run_id, None, "test run", "standalone", "0.1.0", &pending)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_schema_version_row() {
        let ts = open_store().await;
        assert_eq!(ts.store.schema_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_suite_upsert_is_idempotent_per_path() {
        let ts = open_store().await;
        let first = ts
            .store
            .upsert_suite("/suites/mesh", "mesh", "docker", "{}", 10)
            .await
            .unwrap();
        let second = ts
            .store
            .upsert_suite("/suites/mesh", "mesh-renamed", "standalone", "{}", 12)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "mesh-renamed");
        assert_eq!(second.test_count, 12);
        assert_eq!(ts.store.list_suites().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_run_preregisters_pending_tests() {
        let ts = open_store().await;
        let run = seed_run(&ts.store, "r1", &["uc1/tc01", "uc1/tc02", "uc2/tc01"]).await;

        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.total_tests, 3);
        assert_eq!(run.pending_count, 3);
        assert!(run.counters_consistent());

        let tests = ts.store.list_test_results("r1").await.unwrap();
        assert_eq!(tests.len(), 3);
        assert!(tests.iter().all(|t| t.status == TestStatus::Pending));
    }

    #[tokio::test]
    async fn test_counter_invariant_across_transitions() {
        let ts = open_store().await;
        seed_run(&ts.store, "r1", &["uc1/tc01", "uc1/tc02"]).await;

        let to_running = TestUpdate {
            status: Some(TestStatus::Running),
            started_at: Some(Utc::now().timestamp_millis()),
            ..Default::default()
        };
        ts.store.update_test("r1", "uc1/tc01", &to_running).await.unwrap();
        let run = ts.store.get_run("r1").await.unwrap();
        assert_eq!((run.pending_count, run.running_count), (1, 1));
        assert!(run.counters_consistent());

        let to_passed = TestUpdate {
            status: Some(TestStatus::Passed),
            finished_at: Some(Utc::now().timestamp_millis()),
            duration_ms: Some(42),
            ..Default::default()
        };
        ts.store.update_test("r1", "uc1/tc01", &to_passed).await.unwrap();
        let run = ts.store.get_run("r1").await.unwrap();
        assert_eq!((run.pending_count, run.running_count, run.passed), (1, 0, 1));
        assert!(run.counters_consistent());
    }

    #[tokio::test]
    async fn test_crashed_counts_as_failed() {
        let ts = open_store().await;
        seed_run(&ts.store, "r1", &["uc1/tc01"]).await;
        let update = TestUpdate {
            status: Some(TestStatus::Crashed),
            error_message: Some("runner died".into()),
            ..Default::default()
        };
        ts.store.update_test("r1", "uc1/tc01", &update).await.unwrap();
        let run = ts.store.get_run("r1").await.unwrap();
        assert_eq!(run.failed, 1);
        assert!(run.counters_consistent());
    }

    #[tokio::test]
    async fn test_terminal_status_is_frozen() {
        let ts = open_store().await;
        seed_run(&ts.store, "r1", &["uc1/tc01"]).await;

        let passed = TestUpdate {
            status: Some(TestStatus::Passed),
            ..Default::default()
        };
        let outcome = ts.store.update_test("r1", "uc1/tc01", &passed).await.unwrap();
        assert!(!outcome.skipped);

        // A late failed report must not overwrite the terminal row.
        let failed = TestUpdate {
            status: Some(TestStatus::Failed),
            error_message: Some("late duplicate".into()),
            ..Default::default()
        };
        let outcome = ts.store.update_test("r1", "uc1/tc01", &failed).await.unwrap();
        assert!(outcome.skipped);
        assert_eq!(outcome.reason.as_deref(), Some("already terminal"));

        let test = ts.store.get_test_result("r1", "uc1/tc01").await.unwrap();
        assert_eq!(test.status, TestStatus::Passed);
        assert!(test.error_message.is_none());

        let run = ts.store.get_run("r1").await.unwrap();
        assert_eq!((run.passed, run.failed), (1, 0));
        assert!(run.counters_consistent());
    }

    #[tokio::test]
    async fn test_complete_run_wall_clock_duration() {
        let ts = open_store().await;
        seed_run(&ts.store, "r1", &["uc1/tc01"]).await;
        ts.store
            .update_test(
                "r1",
                "uc1/tc01",
                &TestUpdate {
                    status: Some(TestStatus::Passed),
                    duration_ms: Some(999_999),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let run = ts.store.complete_run("r1").await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let finished = run.finished_at.unwrap();
        // duration is wall clock, not the child's inflated duration
        assert_eq!(run.duration_ms.unwrap(), finished - run.started_at);
        assert!(run.duration_ms.unwrap() < 999_999);
    }

    #[tokio::test]
    async fn test_complete_run_failed_when_any_failed() {
        let ts = open_store().await;
        seed_run(&ts.store, "r1", &["uc1/tc01", "uc1/tc02"]).await;
        for (test, status) in [("uc1/tc01", TestStatus::Passed), ("uc1/tc02", TestStatus::Failed)] {
            ts.store
                .update_test(
                    "r1",
                    test,
                    &TestUpdate {
                        status: Some(status),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let run = ts.store.complete_run("r1").await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_mark_cancelled_skips_pending_and_running() {
        let ts = open_store().await;
        seed_run(
            &ts.store,
            "r1",
            &["uc1/tc01", "uc1/tc02", "uc1/tc03", "uc1/tc04"],
        )
        .await;

        // One test already passed, one is running, two still pending.
        ts.store
            .update_test(
                "r1",
                "uc1/tc01",
                &TestUpdate {
                    status: Some(TestStatus::Passed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        ts.store
            .update_test(
                "r1",
                "uc1/tc02",
                &TestUpdate {
                    status: Some(TestStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let run = ts.store.mark_cancelled("r1").await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.cancel_requested);
        assert_eq!(run.passed, 1);
        assert_eq!(run.skipped, 3);
        assert_eq!((run.pending_count, run.running_count), (0, 0));
        assert!(run.counters_consistent());
        assert!(run.finished_at.is_some());

        // The terminal test kept its status; the others carry the reason.
        let t1 = ts.store.get_test_result("r1", "uc1/tc01").await.unwrap();
        assert_eq!(t1.status, TestStatus::Passed);
        let t2 = ts.store.get_test_result("r1", "uc1/tc02").await.unwrap();
        assert_eq!(t2.status, TestStatus::Skipped);
        assert_eq!(t2.error_message.as_deref(), Some("Run cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_request_flag() {
        let ts = open_store().await;
        seed_run(&ts.store, "r1", &["uc1/tc01"]).await;
        assert!(ts.store.request_cancel("r1").await.unwrap());
        assert!(ts.store.get_run("r1").await.unwrap().cancel_requested);

        ts.store.mark_cancelled("r1").await.unwrap();
        // Terminal runs no longer accept the flag
        assert!(!ts.store.request_cancel("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_run_cascades() {
        let ts = open_store().await;
        seed_run(&ts.store, "r1", &["uc1/tc01"]).await;
        let test = ts.store.get_test_result("r1", "uc1/tc01").await.unwrap();

        ts.store
            .add_step_result(
                test.id,
                &StepResultRecord {
                    id: 0,
                    test_result_id: test.id,
                    step_index: 0,
                    phase: "test".into(),
                    handler: "shell".into(),
                    description: "echo".into(),
                    status: "passed".into(),
                    started_at: None,
                    finished_at: None,
                    duration_ms: Some(1),
                    exit_code: Some(0),
                    stdout: "hello".into(),
                    stderr: String::new(),
                    error_message: None,
                },
            )
            .await
            .unwrap();
        ts.store
            .add_captured_value(test.id, "out", "hello")
            .await
            .unwrap();

        ts.store.delete_run("r1").await.unwrap();
        assert!(matches!(
            ts.store.get_run("r1").await,
            Err(StoreError::RunNotFound(_))
        ));
        assert!(ts.store.list_step_results(test.id).await.unwrap().is_empty());
        assert!(ts
            .store
            .list_captured_values(test.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_step_and_assertion_rows_are_append_only() {
        let ts = open_store().await;
        seed_run(&ts.store, "r1", &["uc1/tc01"]).await;
        let test = ts.store.get_test_result("r1", "uc1/tc01").await.unwrap();

        let step = StepResultRecord {
            id: 0,
            test_result_id: test.id,
            step_index: 0,
            phase: "test".into(),
            handler: "shell".into(),
            description: "first".into(),
            status: "passed".into(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            error_message: None,
        };
        ts.store.add_step_result(test.id, &step).await.unwrap();
        // Duplicate (same phase + index) is ignored, not duplicated
        ts.store.add_step_result(test.id, &step).await.unwrap();
        assert_eq!(ts.store.list_step_results(test.id).await.unwrap().len(), 1);

        let assertion = AssertionResultRecord {
            id: 0,
            test_result_id: test.id,
            assertion_index: 0,
            expression: "${last.exit_code} == 0".into(),
            message: None,
            passed: true,
            actual_value: "0".into(),
            expected_value: "0".into(),
        };
        ts.store.add_assertion_result(test.id, &assertion).await.unwrap();
        ts.store.add_assertion_result(test.id, &assertion).await.unwrap();
        assert_eq!(
            ts.store.list_assertion_results(test.id).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_recompute_counters_repairs_drift() {
        let ts = open_store().await;
        seed_run(&ts.store, "r1", &["uc1/tc01", "uc1/tc02"]).await;
        ts.store
            .update_test(
                "r1",
                "uc1/tc01",
                &TestUpdate {
                    status: Some(TestStatus::Passed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let run = ts.store.recompute_counters("r1").await.unwrap();
        assert_eq!((run.pending_count, run.passed), (1, 1));
        assert!(run.counters_consistent());
    }
}

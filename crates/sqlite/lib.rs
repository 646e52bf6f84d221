//! SQLite storage for the tq job queue.
//!
//! Jobs and dead-letter entries live in a database file and survive process
//! restarts. Several storages, in one process or several, may share a file:
//! a claim is a transaction around a conditional `UPDATE`, so each PENDING
//! job is handed to exactly one of them.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tq_sqlite::SqliteStorage;
//! use tq_core::{Job, Storage};
//!
//! #[tokio::main]
//! async fn main() -> tq_core::Result<()> {
//!     let storage = SqliteStorage::new("jobs.db", "myapp").await?;
//!     storage.enqueue(Job::new("send_report")).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tq_core::{DeadLetter, Job, JobId, JobStatus, Result, Storage, TqError};

/// Pause before retrying a claim that hit a locked database.
const BUSY_BACKOFF: Duration = Duration::from_millis(10);

/// Columns of the jobs table, in `JobRow` order.
const JOB_COLUMNS: &str =
    "id, func_name, args, kwargs, status, attempts, created_at, heartbeat_at, error";

type JobRow = (
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    Option<i64>,
    Option<String>,
);

enum Claim {
    Empty,
    Lost,
    Claimed(JobRow),
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// Connection settings for [`SqliteStorage`].
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    location: Location,
    namespace: String,
    max_connections: u32,
    busy_timeout: Duration,
    poll_interval: Duration,
}

impl SqliteOptions {
    /// Store jobs in the database file at `path`, creating it if missing.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            location: Location::File(path.as_ref().to_path_buf()),
            namespace: "tq".to_string(),
            max_connections: 4,
            busy_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Private in-memory database. Uses a single connection that is never recycled.
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            max_connections: 1,
            ..Self::file("")
        }
    }

    /// Prefix for table names, letting several queues share one file.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Pool size. Ignored for in-memory databases.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// How long SQLite waits on a locked database before giving up.
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Re-check interval while a dequeue waits. Bounds how long a job
    /// enqueued by another process can go unnoticed.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn validate(&self) -> Result<()> {
        let valid = !self.namespace.is_empty()
            && self
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(TqError::Config(format!(
                "namespace must be non-empty and contain only [A-Za-z0-9_], got {:?}",
                self.namespace
            )));
        }
        if self.max_connections == 0 {
            return Err(TqError::Config("max_connections must be positive".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(TqError::Config("poll_interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// SQLite storage for job queue state.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    namespace: String,
    notify: Arc<Notify>,
    poll_interval: Duration,
}

impl SqliteStorage {
    /// Open (or create) the database file at `path` with the given namespace.
    pub async fn new(path: impl AsRef<Path>, namespace: &str) -> Result<Self> {
        Self::connect(SqliteOptions::file(path).namespace(namespace)).await
    }

    /// Create an in-memory storage (useful for testing).
    pub async fn in_memory(namespace: &str) -> Result<Self> {
        Self::connect(SqliteOptions::in_memory().namespace(namespace)).await
    }

    /// Connect with explicit options and create the tables if needed.
    pub async fn connect(options: SqliteOptions) -> Result<Self> {
        options.validate()?;

        let (connect, pool_options) = match &options.location {
            Location::File(path) => (
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal),
                SqlitePoolOptions::new().max_connections(options.max_connections),
            ),
            Location::Memory => (
                SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                    TqError::Backend(format!("Invalid SQLite connection string: {}", e))
                })?,
                // Every connection to :memory: is a separate database, so keep exactly one alive.
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None),
            ),
        };

        let pool = pool_options
            .connect_with(connect.busy_timeout(options.busy_timeout))
            .await
            .map_err(|e| TqError::Backend(format!("Failed to connect to SQLite: {}", e)))?;

        let storage = Self {
            pool,
            namespace: options.namespace,
            notify: Arc::new(Notify::new()),
            poll_interval: options.poll_interval,
        };
        storage.init_tables().await?;

        tracing::debug!(namespace = %storage.namespace, "SQLite storage ready");
        Ok(storage)
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The table-name prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Initialize the required tables.
    async fn init_tables(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                func_name TEXT NOT NULL,
                args TEXT NOT NULL,
                kwargs TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                heartbeat_at INTEGER,
                error TEXT
            )
            "#,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to create jobs table: {}", e)))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_status_created ON {} (status, created_at)",
            self.namespace,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to create jobs index: {}", e)))?;

        // No foreign key: entries must outlive the job row.
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                func_name TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                job_json TEXT NOT NULL,
                error TEXT NOT NULL,
                failed_at INTEGER NOT NULL
            )
            "#,
            self.dead_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to create dead table: {}", e)))?;

        Ok(())
    }

    fn jobs_table(&self) -> String {
        format!("{}_jobs", self.namespace)
    }

    fn dead_table(&self) -> String {
        format!("{}_dead", self.namespace)
    }

    /// One attempt at claiming the oldest PENDING row.
    ///
    /// Runs under `BEGIN IMMEDIATE`, so a held write lock surfaces as a busy
    /// error before anything is read. The conditional update still only
    /// matches a PENDING row and reports [`Claim::Lost`] otherwise.
    async fn claim_once(&self) -> std::result::Result<Claim, sqlx::Error> {
        let table = self.jobs_table();
        // Take the write lock up front so two claimers never both read the
        // same candidate inside deferred transactions.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let candidate: Option<(String,)> = sqlx::query_as(&format!(
            "SELECT id FROM {table} WHERE status = 'PENDING' ORDER BY created_at, id LIMIT 1"
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id,)) = candidate else {
            tx.rollback().await?;
            return Ok(Claim::Empty);
        };

        let updated = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET status = 'RUNNING', attempts = attempts + 1, heartbeat_at = ?
            WHERE id = ? AND status = 'PENDING'
            "#
        ))
        .bind(now_micros())
        .bind(&id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(Claim::Lost);
        }

        let row: JobRow =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM {table} WHERE id = ?"))
                .bind(&id)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;

        Ok(Claim::Claimed(row))
    }

    async fn set_outcome(&self, job: &Job, status: JobStatus, error: Option<&str>) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = ?, error = ? WHERE id = ?",
            self.jobs_table()
        ))
        .bind(status.as_str())
        .bind(error)
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to update job status: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(TqError::JobNotFound(job.id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let args = serde_json::to_string(&job.args)?;
        let kwargs = serde_json::to_string(&job.kwargs)?;

        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?)",
            self.jobs_table(),
            JOB_COLUMNS
        ))
        .bind(job.id.to_string())
        .bind(&job.func_name)
        .bind(args)
        .bind(kwargs)
        .bind(JobStatus::Pending.as_str())
        .bind(i64::from(job.attempts))
        .bind(job.created_at.timestamp_micros())
        .bind(job.error.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to enqueue job: {}", e)))?;

        self.notify.notify_one();
        tracing::debug!(job_id = %job.id, func_name = %job.func_name, "Job enqueued");
        Ok(())
    }

    async fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<Job>> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.claim_once().await {
                Ok(Claim::Claimed(row)) => {
                    let job = row_to_job(row)?;
                    tracing::debug!(job_id = %job.id, attempt = job.attempts, "Job claimed");
                    return Ok(Some(job));
                }
                Ok(Claim::Lost) => {
                    tracing::trace!("Lost claim race, retrying");
                    continue;
                }
                Ok(Claim::Empty) => {}
                Err(e) if is_busy(&e) => {
                    tracing::trace!(error = %e, "Database busy during claim, retrying");
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Ok(None);
                    }
                    tokio::time::sleep(BUSY_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    return Err(TqError::Backend(format!("Failed to claim job: {}", e)));
                }
            }

            // Other processes cannot signal us, so never sleep longer than the poll interval.
            let wait = match deadline {
                None => self.poll_interval,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    (deadline - now).min(self.poll_interval)
                }
            };
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn size(&self) -> Result<usize> {
        let row: (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM {} WHERE status = 'PENDING'",
            self.jobs_table()
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to get queue size: {}", e)))?;
        Ok(row.0 as usize)
    }

    async fn mark_done(&self, job: &Job) -> Result<()> {
        self.set_outcome(job, JobStatus::Success, None).await
    }

    async fn mark_failed(&self, job: &Job, error: &str) -> Result<()> {
        self.set_outcome(job, JobStatus::Failed, Some(error)).await
    }

    async fn reap_stale(&self, visibility_timeout: Duration) -> Result<usize> {
        let Ok(threshold) = i64::try_from(visibility_timeout.as_micros()) else {
            return Ok(0);
        };
        let cutoff = now_micros().saturating_sub(threshold);

        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = 'PENDING'
            WHERE status = 'RUNNING' AND (heartbeat_at IS NULL OR heartbeat_at <= ?)
            "#,
            self.jobs_table()
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to reap stale jobs: {}", e)))?;

        let reaped = result.rows_affected() as usize;
        for _ in 0..reaped {
            self.notify.notify_one();
        }
        Ok(reaped)
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> Result<()> {
        let job_json = serde_json::to_string(job)?;
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (job_id, func_name, attempts, job_json, error, failed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            self.dead_table()
        ))
        .bind(job.id.to_string())
        .bind(&job.func_name)
        .bind(i64::from(job.attempts))
        .bind(job_json)
        .bind(error)
        .bind(now_micros())
        .execute(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to push dead job: {}", e)))?;

        tracing::debug!(job_id = %job.id, "Job dead-lettered");
        Ok(())
    }

    async fn list_dead(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(&format!(
            "SELECT job_json, error, failed_at FROM {} ORDER BY id LIMIT ?",
            self.dead_table()
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to list dead jobs: {}", e)))?;

        rows.into_iter()
            .map(|(job_json, error, failed_at)| -> Result<DeadLetter> {
                Ok(DeadLetter {
                    job: serde_json::from_str(&job_json)?,
                    error,
                    failed_at: from_micros(failed_at)?,
                })
            })
            .collect()
    }

    async fn dead_len(&self) -> Result<usize> {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", self.dead_table()))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| TqError::Backend(format!("Failed to get dead length: {}", e)))?;
        Ok(row.0 as usize)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            JOB_COLUMNS,
            self.jobs_table()
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TqError::Backend(format!("Failed to get job: {}", e)))?;

        row.map(row_to_job).transpose()
    }
}

fn row_to_job(row: JobRow) -> Result<Job> {
    let (id, func_name, args, kwargs, status, attempts, created_at, heartbeat_at, error) = row;
    Ok(Job {
        id: id.parse()?,
        func_name,
        args: serde_json::from_str(&args)?,
        kwargs: serde_json::from_str(&kwargs)?,
        status: status.parse()?,
        attempts: u32::try_from(attempts)
            .map_err(|_| TqError::Backend(format!("Invalid attempts value {}", attempts)))?,
        created_at: from_micros(created_at)?,
        heartbeat_at: heartbeat_at.map(from_micros).transpose()?,
        error,
    })
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| TqError::Backend(format!("Invalid timestamp {}", micros)))
}

/// Whether `err` is SQLite reporting a locked or busy database.
fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(
                db.code().as_deref(),
                Some("5" | "6" | "261" | "262" | "517" | "773")
            ) || db.message().contains("database is locked")
        }
        _ => false,
    }
}

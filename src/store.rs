use crate::device_config::DeviceConfig;
use crate::error::StoreError;
use serde::{Serialize, Serializer};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::fmt;
use std::fs;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const TASK_COLUMNS: &str = "id, upgrade_type, work_type, target_address, raw_target_input, \
     version_path, status, created_at, updated_at";
const LOG_COLUMNS: &str = "id, task_id, ts, log_type, message";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Info,
    Warning,
    Error,
    Success,
}

impl LogType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Success => "success",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            "success" => Some(Self::Success),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Task {
    pub id: i64,
    pub upgrade_type: String,
    pub work_type: String,
    pub target_address: String,
    pub raw_target_input: Option<String>,
    pub version_path: String,
    pub status: TaskStatus,
    #[serde(serialize_with = "rfc3339_millis")]
    pub created_at: i64,
    #[serde(serialize_with = "rfc3339_millis")]
    pub updated_at: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub task_id: i64,
    pub message: String,
    pub log_type: LogType,
    #[serde(serialize_with = "rfc3339_millis")]
    pub timestamp: i64,
}

/// Validated input for a new task row.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewTask {
    pub upgrade_type: String,
    pub work_type: String,
    pub target_address: String,
    pub raw_target_input: Option<String>,
    pub version_path: String,
}

#[derive(Debug)]
pub enum FinishOutcome {
    Applied(LogEntry),
    /// The task left `in_progress` before this write (usually a manual stop).
    AlreadyFinished(TaskStatus),
    Missing,
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn format_millis(ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
        .map(|ts| ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

fn rfc3339_millis<S: Serializer>(ms: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_millis(*ms))
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    runtime: Arc<Runtime>,
    url: String,
}

impl Store {
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let trimmed = url.trim();
        if !trimmed.starts_with("sqlite:") {
            return Err(StoreError::UnsupportedUrl(trimmed.to_string()));
        }

        let runtime = Runtime::new().map_err(|e| StoreError::Runtime(e.to_string()))?;
        let in_memory = trimmed.contains(":memory:");
        if !in_memory {
            ensure_sqlite_parent_dir(trimmed);
        }

        let mut options = SqliteConnectOptions::from_str(trimmed)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives only as long as its connection, so the
        // pool is pinned to a single connection that never expires.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = runtime.block_on(async {
            let pool = pool_options.connect_with(options).await?;
            MIGRATOR.run(&pool).await?;
            Ok::<SqlitePool, StoreError>(pool)
        })?;

        tracing::info!(url = %trimmed, "database ready");
        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
            url: trimmed.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn with_db<F, Fut, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(SqlitePool) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.runtime.block_on(f(self.pool.clone()))
    }

    pub fn ping(&self) -> Result<(), StoreError> {
        self.with_db(|pool| async move {
            sqlx::query("SELECT 1").execute(&pool).await?;
            Ok(())
        })
    }

    /// Persists a task in `in_progress` together with its first log entry.
    pub fn insert_task(
        &self,
        new: &NewTask,
        initial_message: &str,
    ) -> Result<(Task, LogEntry), StoreError> {
        let new = new.clone();
        let message = initial_message.to_string();
        self.with_db(|pool| async move {
            let now = now_millis();
            let mut tx = pool.begin().await?;
            let row = sqlx::query(&format!(
                "INSERT INTO tasks (upgrade_type, work_type, target_address, raw_target_input, \
                 version_path, status, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING {TASK_COLUMNS}"
            ))
            .bind(&new.upgrade_type)
            .bind(&new.work_type)
            .bind(&new.target_address)
            .bind(&new.raw_target_input)
            .bind(&new.version_path)
            .bind(TaskStatus::InProgress.as_str())
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            let task = task_from_row(&row)?;

            let row = sqlx::query(&insert_log_sql())
                .bind(task.id)
                .bind(now)
                .bind(task.id)
                .bind(LogType::Info.as_str())
                .bind(&message)
                .fetch_one(&mut *tx)
                .await?;
            let log = log_from_row(&row)?;
            tx.commit().await?;
            Ok((task, log))
        })
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>, StoreError> {
        self.with_db(|pool| async move {
            let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
                .bind(id)
                .fetch_optional(&pool)
                .await?;
            row.as_ref().map(task_from_row).transpose()
        })
    }

    pub fn recent_tasks(&self, limit: usize) -> Result<Vec<Task>, StoreError> {
        self.with_db(|pool| async move {
            let rows = sqlx::query(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, id DESC LIMIT ?"
            ))
            .bind(limit as i64)
            .fetch_all(&pool)
            .await?;
            rows.iter().map(task_from_row).collect()
        })
    }

    /// Removes a task; its log entries go with it through the foreign key.
    pub fn delete_task(&self, id: i64) -> Result<bool, StoreError> {
        self.with_db(|pool| async move {
            let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(id)
                .execute(&pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    pub fn append_log(
        &self,
        task_id: i64,
        message: &str,
        log_type: LogType,
    ) -> Result<LogEntry, StoreError> {
        let message = message.to_string();
        self.with_db(|pool| async move {
            let row = sqlx::query(&insert_log_sql())
                .bind(task_id)
                .bind(now_millis())
                .bind(task_id)
                .bind(log_type.as_str())
                .bind(&message)
                .fetch_one(&pool)
                .await?;
            log_from_row(&row)
        })
    }

    /// Appends an entry only while the task is still `in_progress`.
    ///
    /// Check and insert are one statement, so an entry can never land after
    /// the task's terminal entry.
    pub fn append_progress(
        &self,
        task_id: i64,
        message: &str,
        log_type: LogType,
    ) -> Result<Option<LogEntry>, StoreError> {
        let message = message.to_string();
        self.with_db(|pool| async move {
            let row = sqlx::query(&format!(
                "INSERT INTO task_logs (task_id, ts, log_type, message) \
                 SELECT ?, MAX(?, COALESCE((SELECT MAX(ts) FROM task_logs WHERE task_id = ?), 0)), ?, ? \
                 WHERE EXISTS (SELECT 1 FROM tasks WHERE id = ? AND status = ?) \
                 RETURNING {LOG_COLUMNS}"
            ))
            .bind(task_id)
            .bind(now_millis())
            .bind(task_id)
            .bind(log_type.as_str())
            .bind(&message)
            .bind(task_id)
            .bind(TaskStatus::InProgress.as_str())
            .fetch_optional(&pool)
            .await?;
            row.as_ref().map(log_from_row).transpose()
        })
    }

    /// Entries with `id > after_id`, oldest first.
    pub fn logs_after(&self, task_id: i64, after_id: i64) -> Result<Vec<LogEntry>, StoreError> {
        self.with_db(|pool| async move {
            let rows = sqlx::query(&format!(
                "SELECT {LOG_COLUMNS} FROM task_logs WHERE task_id = ? AND id > ? \
                 ORDER BY ts ASC, id ASC"
            ))
            .bind(task_id)
            .bind(after_id)
            .fetch_all(&pool)
            .await?;
            rows.iter().map(log_from_row).collect()
        })
    }

    pub fn all_logs(&self, task_id: i64) -> Result<Vec<LogEntry>, StoreError> {
        self.logs_after(task_id, 0)
    }

    pub fn latest_log_ts(&self, task_id: i64) -> Result<Option<i64>, StoreError> {
        self.with_db(|pool| async move {
            let ts: Option<i64> =
                sqlx::query_scalar("SELECT MAX(ts) FROM task_logs WHERE task_id = ?")
                    .bind(task_id)
                    .fetch_one(&pool)
                    .await?;
            Ok(ts)
        })
    }

    /// Forces `stopped` and appends the warning entry in one transaction.
    /// Returns `None` when the task does not exist.
    pub fn stop_task(
        &self,
        id: i64,
        message: &str,
    ) -> Result<Option<(Task, LogEntry)>, StoreError> {
        let message = message.to_string();
        self.with_db(|pool| async move {
            let now = now_millis();
            let mut tx = pool.begin().await?;
            let updated = sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ?")
                .bind(TaskStatus::Stopped.as_str())
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if updated.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(None);
            }

            let row = sqlx::query(&insert_log_sql())
                .bind(id)
                .bind(now)
                .bind(id)
                .bind(LogType::Warning.as_str())
                .bind(&message)
                .fetch_one(&mut *tx)
                .await?;
            let log = log_from_row(&row)?;
            let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
            let task = task_from_row(&row)?;
            tx.commit().await?;
            Ok(Some((task, log)))
        })
    }

    /// Moves an `in_progress` task to a terminal status and appends the
    /// closing entry atomically. Never overwrites a task that already left
    /// `in_progress`.
    pub fn finish_task(
        &self,
        id: i64,
        status: TaskStatus,
        message: &str,
        log_type: LogType,
    ) -> Result<FinishOutcome, StoreError> {
        let message = message.to_string();
        self.with_db(|pool| async move {
            let now = now_millis();
            let mut tx = pool.begin().await?;
            let updated = sqlx::query(
                "UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
            )
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .bind(TaskStatus::InProgress.as_str())
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                let current: Option<String> =
                    sqlx::query_scalar("SELECT status FROM tasks WHERE id = ?")
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await?;
                tx.rollback().await?;
                return match current {
                    Some(raw) => Ok(FinishOutcome::AlreadyFinished(parse_status(&raw)?)),
                    None => Ok(FinishOutcome::Missing),
                };
            }

            let row = sqlx::query(&insert_log_sql())
                .bind(id)
                .bind(now)
                .bind(id)
                .bind(log_type.as_str())
                .bind(&message)
                .fetch_one(&mut *tx)
                .await?;
            let log = log_from_row(&row)?;
            tx.commit().await?;
            Ok(FinishOutcome::Applied(log))
        })
    }

    pub fn load_device_config(&self) -> Result<DeviceConfig, StoreError> {
        self.with_db(|pool| async move {
            let row = sqlx::query(
                "SELECT upgrade_types, work_types, environments FROM device_config WHERE id = 1",
            )
            .fetch_optional(&pool)
            .await?;
            Ok(match row {
                Some(row) => DeviceConfig::from_columns(
                    &row.get::<String, _>("upgrade_types"),
                    &row.get::<String, _>("work_types"),
                    &row.get::<String, _>("environments"),
                ),
                None => DeviceConfig::default(),
            })
        })
    }

    pub fn save_device_config(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        let (upgrade_types, work_types, environments) = config.to_columns();
        self.with_db(|pool| async move {
            sqlx::query(
                "INSERT INTO device_config (id, upgrade_types, work_types, environments, updated_at) \
                 VALUES (1, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET upgrade_types = excluded.upgrade_types, \
                 work_types = excluded.work_types, environments = excluded.environments, \
                 updated_at = excluded.updated_at",
            )
            .bind(upgrade_types)
            .bind(work_types)
            .bind(environments)
            .bind(now_millis())
            .execute(&pool)
            .await?;
            Ok(())
        })
    }
}

/// Timestamps are clamped to the task's newest entry so they never go
/// backwards in insertion order, even if the wall clock does.
fn insert_log_sql() -> String {
    format!(
        "INSERT INTO task_logs (task_id, ts, log_type, message) \
         VALUES (?, MAX(?, COALESCE((SELECT MAX(ts) FROM task_logs WHERE task_id = ?), 0)), ?, ?) \
         RETURNING {LOG_COLUMNS}"
    )
}

fn ensure_sqlite_parent_dir(conn: &str) {
    let raw = conn
        .strip_prefix("sqlite://")
        .or_else(|| conn.strip_prefix("sqlite:"))
        .unwrap_or(conn);
    let path = raw.split('?').next().unwrap_or(raw);
    if let Some(parent) = Path::new(path).parent() {
        if parent.as_os_str().is_empty() {
            return;
        }
        if let Err(err) = fs::create_dir_all(parent) {
            tracing::warn!(path = %parent.display(), error = %err, "db-dir-create-failed");
        }
    }
}

fn parse_status(raw: &str) -> Result<TaskStatus, StoreError> {
    TaskStatus::parse(raw).ok_or_else(|| StoreError::CorruptRow {
        table: "tasks",
        detail: format!("unknown status {raw:?}"),
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Task {
        id: row.try_get("id")?,
        upgrade_type: row.try_get("upgrade_type")?,
        work_type: row.try_get("work_type")?,
        target_address: row.try_get("target_address")?,
        raw_target_input: row.try_get("raw_target_input")?,
        version_path: row.try_get("version_path")?,
        status: parse_status(&status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<LogEntry, StoreError> {
    let raw_type: String = row.try_get("log_type")?;
    let log_type = LogType::parse(&raw_type).ok_or_else(|| StoreError::CorruptRow {
        table: "task_logs",
        detail: format!("unknown log_type {raw_type:?}"),
    })?;
    Ok(LogEntry {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        message: row.try_get("message")?,
        log_type,
        timestamp: row.try_get("ts")?,
    })
}

#[cfg(test)]
pub(crate) fn test_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite://{}", dir.path().join("db/test.db").display());
    let store = Store::open(&url).expect("open test store");
    (dir, store)
}

#[cfg(test)]
impl Store {
    /// Runs one raw statement, for tests that need to bend the schema.
    pub(crate) fn execute_sql(&self, sql: &str) -> Result<(), StoreError> {
        let sql = sql.to_string();
        self.with_db(|pool| async move {
            sqlx::query(&sql).execute(&pool).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
pub(crate) fn sample_task() -> NewTask {
    NewTask {
        upgrade_type: "force".into(),
        work_type: "single_process".into(),
        target_address: "200.200.18.101".into(),
        raw_target_input: None,
        version_path: "/builds/v1.2.3".into(),
    }
}

//! Incremental log polling. Clients keep the last id they saw and ask for
//! everything after it; repeated polls with the same cursor are idempotent.

use crate::error::TaskError;
use crate::store::{LogEntry, Store, TaskStatus, now_millis};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Debug, Serialize)]
pub struct LogPage {
    pub logs: Vec<LogEntry>,
    pub status: TaskStatus,
    pub last_log_id: i64,
    /// The task claims to be running but nothing was logged for a while.
    pub stale: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct FullLog {
    pub logs: Vec<LogEntry>,
    pub status: TaskStatus,
}

/// Reads the cursor from `after_id` (or the older `last_log_id` name).
/// Absent means "from the beginning".
pub fn parse_after_id(query: &HashMap<String, String>) -> Result<i64, TaskError> {
    let Some(raw) = query.get("after_id").or_else(|| query.get("last_log_id")) else {
        return Ok(0);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0);
    }
    match raw.parse::<i64>() {
        Ok(value) if value >= 0 => Ok(value),
        _ => Err(TaskError::Validation(format!(
            "after_id must be a non-negative integer, got {raw:?}"
        ))),
    }
}

pub fn fetch(
    store: &Store,
    task_id: i64,
    after_id: i64,
    stale_after: Duration,
) -> Result<LogPage, TaskError> {
    if after_id < 0 {
        return Err(TaskError::Validation(format!(
            "after_id must be a non-negative integer, got {after_id}"
        )));
    }
    let task = store.get_task(task_id)?.ok_or(TaskError::NotFound(task_id))?;
    let logs = store.logs_after(task_id, after_id)?;
    let last_log_id = logs.iter().map(|entry| entry.id).max().unwrap_or(after_id);

    let stale = if task.status == TaskStatus::InProgress {
        let newest = store
            .latest_log_ts(task_id)?
            .unwrap_or(task.updated_at)
            .max(task.updated_at);
        now_millis().saturating_sub(newest) > stale_after.as_millis() as i64
    } else {
        false
    };

    Ok(LogPage {
        logs,
        status: task.status,
        last_log_id,
        stale,
    })
}

pub fn fetch_all(store: &Store, task_id: i64) -> Result<FullLog, TaskError> {
    let task = store.get_task(task_id)?.ok_or(TaskError::NotFound(task_id))?;
    Ok(FullLog {
        logs: store.all_logs(task_id)?,
        status: task.status,
    })
}

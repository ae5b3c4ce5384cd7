//! Task table operations

use crate::models::{EventLevel, EventType, Task, TaskStatus};
use crate::{Error, Result};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

/// Inputs for [`crate::db::Store::update_task_progress`]; the companion
/// event reuses the step/percent/message of the task update.
#[derive(Debug, Clone)]
pub struct TaskProgressUpdate<'a> {
    pub status: TaskStatus,
    pub step: &'a str,
    pub percent: i64,
    pub message: &'a str,
    pub event_type: Option<EventType>,
    pub level: Option<EventLevel>,
    pub error_message: Option<&'a str>,
    pub duration_ms: Option<i64>,
}

fn parse_uuid(value: String, column: &str) -> Result<Uuid> {
    Uuid::parse_str(&value)
        .map_err(|_| Error::Infrastructure(format!("Invalid UUID in {column}: {value}")))
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Task> {
    Ok(Task {
        task_id: parse_uuid(row.get("task_id"), "tasks.task_id")?,
        project_id: parse_uuid(row.get("project_id"), "tasks.project_id")?,
        task_type: row.get("type"),
        status: TaskStatus::parse(row.get("status"))?,
        current_step: row.get("current_step"),
        progress_percent: row.get("progress_percent"),
        message: row.get("message"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        cancel_requested_at: row.get("cancel_requested_at"),
        canceled_at: row.get("canceled_at"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn insert(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    project_id: Uuid,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tasks (
            task_id, project_id, type, status, current_step,
            progress_percent, message, created_at, updated_at
        ) VALUES (?, ?, 'pipeline', 'queued', 'submit', 0, 'Task queued', ?, ?)
        "#,
    )
    .bind(task_id.to_string())
    .bind(project_id.to_string())
    .bind(now)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get(conn: &mut SqliteConnection, task_id: Uuid) -> Result<Option<Task>> {
    let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
        .bind(task_id.to_string())
        .fetch_optional(conn)
        .await?;

    row.as_ref().map(from_row).transpose()
}

pub async fn list(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<Task>> {
    let rows = sqlx::query("SELECT * FROM tasks ORDER BY updated_at DESC LIMIT ?")
        .bind(limit)
        .fetch_all(conn)
        .await?;

    rows.iter().map(from_row).collect()
}

pub async fn list_for_project(
    conn: &mut SqliteConnection,
    project_id: Uuid,
    limit: i64,
) -> Result<Vec<Task>> {
    let rows = sqlx::query(
        "SELECT * FROM tasks WHERE project_id = ? ORDER BY created_at DESC LIMIT ?",
    )
    .bind(project_id.to_string())
    .bind(limit)
    .fetch_all(conn)
    .await?;

    rows.iter().map(from_row).collect()
}

pub async fn latest_for_project(
    conn: &mut SqliteConnection,
    project_id: Uuid,
) -> Result<Option<Task>> {
    let row = sqlx::query(
        "SELECT * FROM tasks WHERE project_id = ? ORDER BY created_at DESC LIMIT 1",
    )
    .bind(project_id.to_string())
    .fetch_optional(conn)
    .await?;

    row.as_ref().map(from_row).transpose()
}

pub async fn apply_progress(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    update: &TaskProgressUpdate<'_>,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks SET
            status = ?,
            current_step = ?,
            progress_percent = ?,
            message = ?,
            error_message = COALESCE(?, error_message),
            started_at = ?,
            finished_at = ?,
            updated_at = ?
        WHERE task_id = ?
        "#,
    )
    .bind(update.status.as_str())
    .bind(update.step)
    .bind(update.percent)
    .bind(update.message)
    .bind(update.error_message)
    .bind(started_at)
    .bind(finished_at)
    .bind(now)
    .bind(task_id.to_string())
    .execute(conn)
    .await?;

    Ok(())
}

/// A queued task cancels immediately; it never ran.
pub async fn cancel_queued(conn: &mut SqliteConnection, task_id: Uuid, now: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks SET
            status = 'canceled',
            message = 'Task canceled before it started',
            cancel_requested_at = ?,
            canceled_at = ?,
            finished_at = ?,
            updated_at = ?
        WHERE task_id = ?
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(task_id.to_string())
    .execute(conn)
    .await?;

    Ok(())
}

/// A running task moves to `canceling`; the runner observes the request at
/// its next safe point.
pub async fn request_cancel_running(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks SET
            status = 'canceling',
            cancel_requested_at = ?,
            updated_at = ?
        WHERE task_id = ?
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(task_id.to_string())
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn is_cancel_requested(conn: &mut SqliteConnection, task_id: Uuid) -> Result<bool> {
    let row = sqlx::query("SELECT status, cancel_requested_at FROM tasks WHERE task_id = ?")
        .bind(task_id.to_string())
        .fetch_optional(conn)
        .await?;

    let Some(row) = row else {
        return Ok(false);
    };

    let status = TaskStatus::parse(row.get("status"))?;
    let cancel_requested_at: Option<i64> = row.get("cancel_requested_at");
    Ok(cancel_requested_at.is_some() || status == TaskStatus::Canceling)
}

pub async fn finalize_canceled(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    reason: &str,
    step: &str,
    percent: i64,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks SET
            status = 'canceled',
            current_step = ?,
            progress_percent = ?,
            message = ?,
            canceled_at = ?,
            finished_at = ?,
            updated_at = ?
        WHERE task_id = ?
        "#,
    )
    .bind(step)
    .bind(percent)
    .bind(reason)
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(task_id.to_string())
    .execute(conn)
    .await?;

    Ok(())
}

/// Retry clears every terminal marker so the cancel-requested predicate
/// reads false again and the runner treats the task as fresh.
pub async fn reset_for_retry(conn: &mut SqliteConnection, task_id: Uuid, now: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tasks SET
            status = 'queued',
            current_step = 'retry',
            progress_percent = 0,
            message = 'Retry requested',
            error_message = NULL,
            cancel_requested_at = NULL,
            canceled_at = NULL,
            finished_at = NULL,
            updated_at = ?
        WHERE task_id = ?
        "#,
    )
    .bind(now)
    .bind(task_id.to_string())
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn interrupted(conn: &mut SqliteConnection) -> Result<Vec<Task>> {
    let rows = sqlx::query("SELECT * FROM tasks WHERE status IN ('running', 'canceling')")
        .fetch_all(conn)
        .await?;

    rows.iter().map(from_row).collect()
}

pub async fn delete_for_project(conn: &mut SqliteConnection, project_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM tasks WHERE project_id = ?")
        .bind(project_id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

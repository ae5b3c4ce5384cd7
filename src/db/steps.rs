//! Task step checkpoint operations
//!
//! One row per `(task_id, step)`. A `completed` row is immutable except
//! through [`reset_incomplete`], which an explicit retry invokes and which
//! only touches rows that are not completed.

use super::now_ms;
use crate::models::{StepStatus, TaskStepState};
use crate::{Error, Result};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

fn parse_uuid(value: String, column: &str) -> Result<Uuid> {
    Uuid::parse_str(&value)
        .map_err(|_| Error::Infrastructure(format!("Invalid UUID in {column}: {value}")))
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskStepState> {
    Ok(TaskStepState {
        task_id: parse_uuid(row.get("task_id"), "task_step_states.task_id")?,
        project_id: parse_uuid(row.get("project_id"), "task_step_states.project_id")?,
        step: row.get("step"),
        status: StepStatus::parse(row.get("status"))?,
        attempt: row.get("attempt"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        duration_ms: row.get("duration_ms"),
        error_message: row.get("error_message"),
        output_json: row.get("output_json"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Upsert to `running`, bumping `attempt` and clearing finish markers from
/// any previous attempt.
pub async fn mark_start(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    project_id: Uuid,
    step: &str,
) -> Result<()> {
    let now = now_ms();
    sqlx::query(
        r#"
        INSERT INTO task_step_states (
            task_id, project_id, step, status, attempt, started_at, created_at, updated_at
        ) VALUES (?, ?, ?, 'running', 1, ?, ?, ?)
        ON CONFLICT(task_id, step) DO UPDATE SET
            status = 'running',
            attempt = attempt + 1,
            started_at = excluded.started_at,
            finished_at = NULL,
            duration_ms = NULL,
            error_message = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(task_id.to_string())
    .bind(project_id.to_string())
    .bind(step)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

/// Write the terminal status and computed duration; returns the duration.
pub async fn mark_end(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    step: &str,
    status: StepStatus,
    error_message: Option<&str>,
    output_json: Option<&serde_json::Value>,
) -> Result<i64> {
    let row: Option<Option<i64>> = sqlx::query_scalar(
        "SELECT started_at FROM task_step_states WHERE task_id = ? AND step = ?",
    )
    .bind(task_id.to_string())
    .bind(step)
    .fetch_optional(&mut *conn)
    .await?;
    let started_at = row.flatten();

    let now = now_ms();
    let duration_ms = started_at.map_or(0, |started| (now - started).max(0));

    let result = sqlx::query(
        r#"
        UPDATE task_step_states SET
            status = ?,
            finished_at = ?,
            duration_ms = ?,
            error_message = ?,
            output_json = COALESCE(?, output_json),
            updated_at = ?
        WHERE task_id = ? AND step = ?
        "#,
    )
    .bind(status.as_str())
    .bind(now)
    .bind(duration_ms)
    .bind(error_message)
    .bind(output_json.map(|v| v.to_string()))
    .bind(now)
    .bind(task_id.to_string())
    .bind(step)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!(
            "Step state not found: {task_id}/{step}"
        )));
    }
    Ok(duration_ms)
}

pub async fn list_for_task(
    conn: &mut SqliteConnection,
    task_id: Uuid,
) -> Result<Vec<TaskStepState>> {
    let rows = sqlx::query(
        "SELECT * FROM task_step_states WHERE task_id = ? ORDER BY created_at, step",
    )
    .bind(task_id.to_string())
    .fetch_all(conn)
    .await?;

    rows.iter().map(from_row).collect()
}

/// Reset every row that is not `completed` back to `pending` with null
/// timings. A row left `running` by a crash is not completed and is reset
/// too; `attempt` counts across retries and is preserved.
pub async fn reset_incomplete(conn: &mut SqliteConnection, task_id: Uuid, now: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE task_step_states SET
            status = 'pending',
            started_at = NULL,
            finished_at = NULL,
            duration_ms = NULL,
            error_message = NULL,
            updated_at = ?
        WHERE task_id = ? AND status != 'completed'
        "#,
    )
    .bind(now)
    .bind(task_id.to_string())
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn delete_for_project(conn: &mut SqliteConnection, project_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM task_step_states WHERE project_id = ?")
        .bind(project_id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

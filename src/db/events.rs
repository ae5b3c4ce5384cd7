//! Task event log operations
//!
//! Events are append-only; nothing in the crate updates or deletes a row
//! except the project delete cascade. Ordering by `created_at` (with the
//! rowid as tiebreaker for same-millisecond writes) is the canonical
//! timeline.

use super::now_ms;
use crate::models::{EventLevel, EventType, TaskEvent};
use crate::{Error, Result};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

/// Upper bound on a stored event message, in characters.
pub const MAX_EVENT_MESSAGE_CHARS: usize = 1600;

/// Bound a message to [`MAX_EVENT_MESSAGE_CHARS`], appending a marker with
/// the number of characters dropped.
pub fn bound_message(message: &str) -> String {
    let total = message.chars().count();
    if total <= MAX_EVENT_MESSAGE_CHARS {
        return message.to_string();
    }

    let cut = message
        .char_indices()
        .nth(MAX_EVENT_MESSAGE_CHARS)
        .map(|(idx, _)| idx)
        .unwrap_or(message.len());
    let dropped = total - MAX_EVENT_MESSAGE_CHARS;
    format!("{}...[truncated {} chars]", &message[..cut], dropped)
}

fn parse_uuid(value: String, column: &str) -> Result<Uuid> {
    Uuid::parse_str(&value)
        .map_err(|_| Error::Infrastructure(format!("Invalid UUID in {column}: {value}")))
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskEvent> {
    Ok(TaskEvent {
        id: row.get("id"),
        task_id: parse_uuid(row.get("task_id"), "task_events.task_id")?,
        project_id: parse_uuid(row.get("project_id"), "task_events.project_id")?,
        step: row.get("step"),
        event_type: EventType::parse(row.get("event_type"))?,
        level: EventLevel::parse(row.get("level"))?,
        message: row.get("message"),
        percent: row.get("percent"),
        duration_ms: row.get("duration_ms"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn append(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    project_id: Uuid,
    step: &str,
    event_type: EventType,
    level: EventLevel,
    message: &str,
    percent: Option<i64>,
    duration_ms: Option<i64>,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO task_events (
            task_id, project_id, step, event_type, level,
            message, percent, duration_ms, error_message, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(task_id.to_string())
    .bind(project_id.to_string())
    .bind(step)
    .bind(event_type.as_str())
    .bind(level.as_str())
    .bind(bound_message(message))
    .bind(percent)
    .bind(duration_ms)
    .bind(error_message)
    .bind(now_ms())
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn list_for_task(
    conn: &mut SqliteConnection,
    task_id: Uuid,
    limit: i64,
) -> Result<Vec<TaskEvent>> {
    let rows = sqlx::query(
        "SELECT * FROM task_events WHERE task_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(task_id.to_string())
    .bind(limit)
    .fetch_all(conn)
    .await?;

    rows.iter().map(from_row).collect()
}

pub async fn delete_for_project(conn: &mut SqliteConnection, project_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM task_events WHERE project_id = ?")
        .bind(project_id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_pass_through() {
        assert_eq!(bound_message("hello"), "hello");
    }

    #[test]
    fn long_messages_are_truncated_with_marker() {
        let long = "x".repeat(MAX_EVENT_MESSAGE_CHARS + 25);
        let bounded = bound_message(&long);
        assert!(bounded.starts_with(&"x".repeat(MAX_EVENT_MESSAGE_CHARS)));
        assert!(bounded.ends_with("...[truncated 25 chars]"));
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let long = "字".repeat(MAX_EVENT_MESSAGE_CHARS + 3);
        let bounded = bound_message(&long);
        assert_eq!(
            bounded.chars().take(MAX_EVENT_MESSAGE_CHARS).count(),
            MAX_EVENT_MESSAGE_CHARS
        );
        assert!(bounded.ends_with("...[truncated 3 chars]"));
    }
}

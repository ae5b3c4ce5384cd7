//! Watch progress operations
//!
//! Per-viewer resume positions; independent of pipeline execution.

use super::now_ms;
use crate::models::WatchProgress;
use crate::Result;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

pub async fn upsert(
    conn: &mut SqliteConnection,
    project_id: Uuid,
    viewer_id: &str,
    position_sec: f64,
    duration_sec: f64,
) -> Result<WatchProgress> {
    let now = now_ms();
    sqlx::query(
        r#"
        INSERT INTO watch_progress (
            project_id, viewer_id, position_sec, duration_sec, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(project_id, viewer_id) DO UPDATE SET
            position_sec = excluded.position_sec,
            duration_sec = excluded.duration_sec,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(project_id.to_string())
    .bind(viewer_id)
    .bind(position_sec)
    .bind(duration_sec)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(WatchProgress {
        project_id,
        viewer_id: viewer_id.to_string(),
        position_sec,
        duration_sec,
        updated_at: now,
    })
}

pub async fn count_for_project(conn: &mut SqliteConnection, project_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM watch_progress WHERE project_id = ?")
        .bind(project_id.to_string())
        .fetch_one(conn)
        .await?
        .get("n");
    Ok(count)
}

pub async fn delete_for_project(conn: &mut SqliteConnection, project_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM watch_progress WHERE project_id = ?")
        .bind(project_id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

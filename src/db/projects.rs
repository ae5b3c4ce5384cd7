//! Project table operations

use super::now_ms;
use crate::models::{Project, ProjectStatus, VideoSource};
use crate::{Error, Result};
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

/// Partial update applied by the pipeline; only `Some` fields are written.
#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub status: Option<ProjectStatus>,
    pub title: Option<String>,
    pub thumbnail_url: Option<String>,
    pub source_url: Option<String>,
    pub media_path: Option<String>,
    pub subtitle_path: Option<String>,
    pub asr_vtt_path: Option<String>,
    pub llm_cost_twd: Option<f64>,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
}

impl ProjectPatch {
    pub fn status(status: ProjectStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

fn parse_uuid(value: String, column: &str) -> Result<Uuid> {
    Uuid::parse_str(&value)
        .map_err(|_| Error::Infrastructure(format!("Invalid UUID in {column}: {value}")))
}

fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Project> {
    Ok(Project {
        project_id: parse_uuid(row.get("project_id"), "projects.project_id")?,
        source: VideoSource::parse(row.get("source"))?,
        source_video_id: row.get("source_video_id"),
        original_input: row.get("original_input"),
        translation_hint: row.get("translation_hint"),
        status: ProjectStatus::parse(row.get("status"))?,
        title: row.get("title"),
        thumbnail_url: row.get("thumbnail_url"),
        source_url: row.get("source_url"),
        media_path: row.get("media_path"),
        subtitle_path: row.get("subtitle_path"),
        asr_vtt_path: row.get("asr_vtt_path"),
        llm_cost_twd: row.get("llm_cost_twd"),
        llm_provider: row.get("llm_provider"),
        llm_model: row.get("llm_model"),
        input_tokens: row.get("input_tokens"),
        output_tokens: row.get("output_tokens"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

pub async fn find_by_source(
    conn: &mut SqliteConnection,
    source: VideoSource,
    source_video_id: &str,
) -> Result<Option<Uuid>> {
    let row: Option<String> = sqlx::query_scalar(
        "SELECT project_id FROM projects WHERE source = ? AND source_video_id = ?",
    )
    .bind(source.as_str())
    .bind(source_video_id)
    .fetch_optional(conn)
    .await?;

    row.map(|id| parse_uuid(id, "projects.project_id")).transpose()
}

pub async fn insert(
    conn: &mut SqliteConnection,
    project_id: Uuid,
    source: VideoSource,
    source_video_id: &str,
    original_input: &str,
    translation_hint: Option<&str>,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO projects (
            project_id, source, source_video_id, original_input,
            translation_hint, status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, 'queued', ?, ?)
        "#,
    )
    .bind(project_id.to_string())
    .bind(source.as_str())
    .bind(source_video_id)
    .bind(original_input)
    .bind(translation_hint)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get(conn: &mut SqliteConnection, project_id: Uuid) -> Result<Option<Project>> {
    let row = sqlx::query("SELECT * FROM projects WHERE project_id = ?")
        .bind(project_id.to_string())
        .fetch_optional(conn)
        .await?;

    row.as_ref().map(from_row).transpose()
}

pub async fn list(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<Project>> {
    let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at DESC LIMIT ?")
        .bind(limit)
        .fetch_all(conn)
        .await?;

    rows.iter().map(from_row).collect()
}

/// COALESCE keeps the stored value wherever the patch binds NULL, so a
/// partial patch never clears a field.
pub async fn update_from_pipeline(
    conn: &mut SqliteConnection,
    project_id: Uuid,
    patch: ProjectPatch,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE projects SET
            status = COALESCE(?, status),
            title = COALESCE(?, title),
            thumbnail_url = COALESCE(?, thumbnail_url),
            source_url = COALESCE(?, source_url),
            media_path = COALESCE(?, media_path),
            subtitle_path = COALESCE(?, subtitle_path),
            asr_vtt_path = COALESCE(?, asr_vtt_path),
            llm_cost_twd = COALESCE(?, llm_cost_twd),
            llm_provider = COALESCE(?, llm_provider),
            llm_model = COALESCE(?, llm_model),
            input_tokens = COALESCE(?, input_tokens),
            output_tokens = COALESCE(?, output_tokens),
            updated_at = ?
        WHERE project_id = ?
        "#,
    )
    .bind(patch.status.map(|s| s.as_str()))
    .bind(patch.title)
    .bind(patch.thumbnail_url)
    .bind(patch.source_url)
    .bind(patch.media_path)
    .bind(patch.subtitle_path)
    .bind(patch.asr_vtt_path)
    .bind(patch.llm_cost_twd)
    .bind(patch.llm_provider)
    .bind(patch.llm_model)
    .bind(patch.input_tokens)
    .bind(patch.output_tokens)
    .bind(now_ms())
    .bind(project_id.to_string())
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("Project not found: {project_id}")));
    }
    Ok(())
}

pub async fn set_status(
    conn: &mut SqliteConnection,
    project_id: Uuid,
    status: ProjectStatus,
) -> Result<()> {
    update_from_pipeline(conn, project_id, ProjectPatch::status(status)).await
}

pub async fn delete(conn: &mut SqliteConnection, project_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM projects WHERE project_id = ?")
        .bind(project_id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

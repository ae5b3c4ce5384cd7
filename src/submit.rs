//! Caller-facing mutations: submit, retry, delete
//!
//! Thin service layer between the RPC surface and the store/runner pair.
//! Submission parses the source reference, rejects duplicates via the store
//! and enqueues the new task; retry re-queues through the store's reset;
//! delete renames the project directory aside before cascading rows.

use crate::config::Config;
use crate::db::{Store, SubmitOutcome};
use crate::models::parse_source;
use crate::pipeline::{PipelineRunner, QueueItem};
use crate::{Error, Result};
use uuid::Uuid;

const MAX_HINT_CHARS: usize = 400;

pub async fn submit_project(
    store: &Store,
    runner: &PipelineRunner,
    source_or_url: &str,
    translation_hint: Option<&str>,
) -> Result<SubmitOutcome> {
    let source_or_url = source_or_url.trim();
    if source_or_url.chars().count() < 2 {
        return Err(Error::Validation(
            "sourceOrUrl must be at least 2 characters".into(),
        ));
    }
    if let Some(hint) = translation_hint {
        if hint.chars().count() > MAX_HINT_CHARS {
            return Err(Error::Validation(format!(
                "translationHint must be at most {MAX_HINT_CHARS} characters"
            )));
        }
    }

    let (source, source_video_id) = parse_source(source_or_url)?;

    let outcome = store
        .submit_project(source, &source_video_id, source_or_url, translation_hint)
        .await?;

    tracing::info!(
        project_id = %outcome.project_id,
        task_id = %outcome.task_id,
        source = source.as_str(),
        source_video_id,
        "Project submitted"
    );

    runner.enqueue(QueueItem {
        task_id: outcome.task_id,
        project_id: outcome.project_id,
    });

    Ok(outcome)
}

pub async fn retry_task(
    store: &Store,
    runner: &PipelineRunner,
    task_id: Uuid,
) -> Result<(Uuid, Uuid)> {
    let (task_id, project_id) = store.retry_task(task_id).await?;
    runner.enqueue(QueueItem {
        task_id,
        project_id,
    });
    Ok((task_id, project_id))
}

/// Rename the project directory aside, then cascade row deletion. A missing
/// directory is fine; any other filesystem error aborts before rows are
/// touched.
pub async fn delete_project(store: &Store, config: &Config, project_id: Uuid) -> Result<()> {
    let dir = config.project_dir(&project_id);
    let tombstone = config.projects_dir.join(format!("_deleted_{project_id}"));

    match std::fs::rename(&dir, &tombstone) {
        Ok(()) => {
            tracing::info!(project_id = %project_id, "Project directory renamed aside");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    store.delete_project(project_id).await
}

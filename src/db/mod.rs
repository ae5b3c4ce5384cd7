//! Database initialization and the Store facade
//!
//! The store owns every status mutation in the system. All multi-row
//! operations run inside a single transaction; callers never see
//! half-written state.

pub mod events;
pub mod projects;
pub mod steps;
pub mod tasks;
pub mod watch;

use crate::models::{
    EventLevel, EventType, Project, ProjectWithLatestTask, StepStatus, Task, TaskEvent,
    TaskStatus, TaskStepState, VideoSource, WatchProgress,
};
use crate::{Error, Result};
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

pub use events::{bound_message, MAX_EVENT_MESSAGE_CHARS};
pub use projects::ProjectPatch;
pub use tasks::TaskProgressUpdate;

/// Current UTC time in milliseconds since epoch; every row timestamp in the
/// schema uses this resolution.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Open (creating if needed) the SQLite database and ensure the schema.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePool::connect(&db_url).await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_projects_table(&pool).await?;
    create_tasks_table(&pool).await?;
    create_task_step_states_table(&pool).await?;
    create_task_events_table(&pool).await?;
    create_watch_progress_table(&pool).await?;

    Ok(pool)
}

async fn create_projects_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            project_id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            source_video_id TEXT NOT NULL,
            original_input TEXT NOT NULL,
            translation_hint TEXT,
            status TEXT NOT NULL DEFAULT 'queued',
            title TEXT,
            thumbnail_url TEXT,
            source_url TEXT,
            media_path TEXT,
            subtitle_path TEXT,
            asr_vtt_path TEXT,
            llm_cost_twd REAL NOT NULL DEFAULT 0,
            llm_provider TEXT,
            llm_model TEXT,
            input_tokens INTEGER,
            output_tokens INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_source_video
         ON projects(source, source_video_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_projects_created_at ON projects(created_at)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_tasks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            type TEXT NOT NULL DEFAULT 'pipeline',
            status TEXT NOT NULL DEFAULT 'queued',
            current_step TEXT NOT NULL DEFAULT 'submit',
            progress_percent INTEGER NOT NULL DEFAULT 0,
            message TEXT NOT NULL DEFAULT '',
            started_at INTEGER,
            finished_at INTEGER,
            cancel_requested_at INTEGER,
            canceled_at INTEGER,
            error_message TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_project_id ON tasks(project_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_updated_at ON tasks(updated_at)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_task_step_states_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_step_states (
            task_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            step TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempt INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER,
            finished_at INTEGER,
            duration_ms INTEGER,
            error_message TEXT,
            output_json TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(task_id, step)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_step_states_task_id ON task_step_states(task_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_step_states_project_id ON task_step_states(project_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_task_events_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            step TEXT NOT NULL DEFAULT 'system',
            event_type TEXT NOT NULL DEFAULT 'system',
            level TEXT NOT NULL DEFAULT 'info',
            message TEXT NOT NULL,
            percent INTEGER,
            duration_ms INTEGER,
            error_message TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_events_task_id ON task_events(task_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_task_events_project_id ON task_events(project_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_watch_progress_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS watch_progress (
            project_id TEXT NOT NULL,
            viewer_id TEXT NOT NULL,
            position_sec REAL NOT NULL,
            duration_sec REAL NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(project_id, viewer_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_watch_progress_project_id ON watch_progress(project_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Outcome of a successful submission.
#[derive(Debug, Clone, Copy)]
pub struct SubmitOutcome {
    pub project_id: Uuid,
    pub task_id: Uuid,
}

/// Durable relational state for projects, tasks, steps, events and watch
/// progress. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Atomically insert a new project, its first task and the initial
    /// system event. Fails with Conflict when `(source, source_video_id)`
    /// already exists, leaving no side effects.
    pub async fn submit_project(
        &self,
        source: VideoSource,
        source_video_id: &str,
        original_input: &str,
        translation_hint: Option<&str>,
    ) -> Result<SubmitOutcome> {
        let mut tx = self.pool.begin().await?;

        if let Some(existing) =
            projects::find_by_source(&mut tx, source, source_video_id).await?
        {
            return Err(Error::Conflict(format!(
                "Project already exists for {}/{}: {}",
                source.as_str(),
                source_video_id,
                existing
            )));
        }

        let project_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let now = now_ms();

        projects::insert(
            &mut tx,
            project_id,
            source,
            source_video_id,
            original_input,
            translation_hint,
            now,
        )
        .await?;
        tasks::insert(&mut tx, task_id, project_id, now).await?;
        events::append(
            &mut tx,
            task_id,
            project_id,
            "submit",
            EventType::System,
            EventLevel::Info,
            &format!("Project submitted: {original_input}"),
            Some(0),
            None,
            None,
        )
        .await?;

        tx.commit().await?;
        Ok(SubmitOutcome {
            project_id,
            task_id,
        })
    }

    /// Projects ordered by `created_at` desc, each with its latest task.
    pub async fn list_projects(&self, limit: i64) -> Result<Vec<ProjectWithLatestTask>> {
        let mut conn = self.pool.acquire().await?;
        let rows = projects::list(&mut conn, limit).await?;

        let mut out = Vec::with_capacity(rows.len());
        for project in rows {
            let latest_task = tasks::latest_for_project(&mut conn, project.project_id).await?;
            out.push(ProjectWithLatestTask {
                project,
                latest_task,
            });
        }
        Ok(out)
    }

    pub async fn list_tasks(&self, limit: i64) -> Result<Vec<Task>> {
        let mut conn = self.pool.acquire().await?;
        tasks::list(&mut conn, limit).await
    }

    /// Project row plus up to 20 of its tasks, newest first.
    pub async fn get_project(&self, project_id: Uuid) -> Result<(Project, Vec<Task>)> {
        let mut conn = self.pool.acquire().await?;
        let project = projects::get(&mut conn, project_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Project not found: {project_id}")))?;
        let tasks = tasks::list_for_project(&mut conn, project_id, 20).await?;
        Ok((project, tasks))
    }

    pub async fn find_project(&self, project_id: Uuid) -> Result<Option<Project>> {
        let mut conn = self.pool.acquire().await?;
        projects::get(&mut conn, project_id).await
    }

    /// Task row plus up to 400 of its events, newest first.
    pub async fn get_task(&self, task_id: Uuid) -> Result<(Task, Vec<TaskEvent>)> {
        let mut conn = self.pool.acquire().await?;
        let task = tasks::get(&mut conn, task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Task not found: {task_id}")))?;
        let events = events::list_for_task(&mut conn, task_id, 400).await?;
        Ok((task, events))
    }

    pub async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        let mut conn = self.pool.acquire().await?;
        tasks::get(&mut conn, task_id).await
    }

    /// Partial project update; only provided fields are written.
    pub async fn update_project_from_pipeline(
        &self,
        project_id: Uuid,
        patch: ProjectPatch,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        projects::update_from_pipeline(&mut conn, project_id, patch).await
    }

    /// Update the task row and append the companion event atomically.
    ///
    /// Sets `started_at` on the first transition into `running` and
    /// `finished_at` iff the new status is terminal.
    pub async fn update_task_progress(
        &self,
        task_id: Uuid,
        update: TaskProgressUpdate<'_>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let task = tasks::get(&mut tx, task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Task not found: {task_id}")))?;

        let now = now_ms();
        let started_at = task.started_at.or(if update.status == TaskStatus::Running {
            Some(now)
        } else {
            None
        });
        let finished_at = if update.status.is_terminal() {
            Some(now)
        } else {
            task.finished_at
        };

        tasks::apply_progress(&mut tx, task_id, &update, started_at, finished_at, now).await?;

        events::append(
            &mut tx,
            task_id,
            task.project_id,
            update.step,
            update.event_type.unwrap_or(EventType::Log),
            update.level.unwrap_or(EventLevel::Info),
            update.message,
            Some(update.percent),
            update.duration_ms,
            update.error_message,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Upsert the step checkpoint to `running`, bumping `attempt` and
    /// clearing the previous finish/duration/error.
    pub async fn mark_step_start(
        &self,
        task_id: Uuid,
        project_id: Uuid,
        step: &str,
    ) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        steps::mark_start(&mut conn, task_id, project_id, step).await
    }

    /// Write the terminal step status; returns the computed duration.
    pub async fn mark_step_end(
        &self,
        task_id: Uuid,
        step: &str,
        status: StepStatus,
        error_message: Option<&str>,
        output_json: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        steps::mark_end(&mut conn, task_id, step, status, error_message, output_json).await
    }

    /// Current checkpoint snapshot for a task.
    pub async fn get_task_step_states(&self, task_id: Uuid) -> Result<Vec<TaskStepState>> {
        let mut conn = self.pool.acquire().await?;
        steps::list_for_task(&mut conn, task_id).await
    }

    /// State-dependent cancel request; returns the task status after the
    /// call. Never touches step rows.
    pub async fn request_task_cancel(&self, task_id: Uuid) -> Result<TaskStatus> {
        let mut tx = self.pool.begin().await?;

        let task = tasks::get(&mut tx, task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Task not found: {task_id}")))?;

        let now = now_ms();
        let outcome = match task.status {
            status if status.is_terminal() => status,
            TaskStatus::Queued => {
                tasks::cancel_queued(&mut tx, task_id, now).await?;
                projects::set_status(&mut tx, task.project_id, crate::models::ProjectStatus::Canceled)
                    .await?;
                events::append(
                    &mut tx,
                    task_id,
                    task.project_id,
                    &task.current_step,
                    EventType::System,
                    EventLevel::Warn,
                    "Task canceled before it started",
                    Some(task.progress_percent),
                    None,
                    None,
                )
                .await?;
                TaskStatus::Canceled
            }
            TaskStatus::Canceling => TaskStatus::Canceling,
            _ => {
                tasks::request_cancel_running(&mut tx, task_id, now).await?;
                projects::set_status(
                    &mut tx,
                    task.project_id,
                    crate::models::ProjectStatus::Canceling,
                )
                .await?;
                events::append(
                    &mut tx,
                    task_id,
                    task.project_id,
                    &task.current_step,
                    EventType::System,
                    EventLevel::Warn,
                    "Cancellation requested; task will stop at the next safe point",
                    Some(task.progress_percent),
                    None,
                    None,
                )
                .await?;
                TaskStatus::Canceling
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// True iff a cancel has been requested and not yet cleared by a retry.
    pub async fn is_task_cancel_requested(&self, task_id: Uuid) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        tasks::is_cancel_requested(&mut conn, task_id).await
    }

    /// Final cancellation transition for a task the runner has stopped.
    pub async fn mark_task_canceled(
        &self,
        task_id: Uuid,
        reason: &str,
        step: &str,
        percent: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let task = tasks::get(&mut tx, task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Task not found: {task_id}")))?;

        let now = now_ms();
        tasks::finalize_canceled(&mut tx, task_id, reason, step, percent, now).await?;
        projects::set_status(&mut tx, task.project_id, crate::models::ProjectStatus::Canceled)
            .await?;
        events::append(
            &mut tx,
            task_id,
            task.project_id,
            step,
            EventType::System,
            EventLevel::Warn,
            reason,
            Some(percent),
            None,
            None,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Re-queue a task, resetting every step row that is not `completed`.
    /// Returns the ids for the caller to re-enqueue.
    pub async fn retry_task(&self, task_id: Uuid) -> Result<(Uuid, Uuid)> {
        let mut tx = self.pool.begin().await?;

        let task = tasks::get(&mut tx, task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Task not found: {task_id}")))?;

        let now = now_ms();
        tasks::reset_for_retry(&mut tx, task_id, now).await?;
        projects::set_status(&mut tx, task.project_id, crate::models::ProjectStatus::Queued)
            .await?;
        steps::reset_incomplete(&mut tx, task_id, now).await?;
        events::append(
            &mut tx,
            task_id,
            task.project_id,
            "retry",
            EventType::System,
            EventLevel::Info,
            "Task retry requested; completed steps will be skipped",
            Some(0),
            None,
            None,
        )
        .await?;

        tx.commit().await?;
        Ok((task_id, task.project_id))
    }

    /// Tasks left in `running`/`canceling`; read once at startup.
    pub async fn get_interrupted_tasks(&self) -> Result<Vec<Task>> {
        let mut conn = self.pool.acquire().await?;
        tasks::interrupted(&mut conn).await
    }

    /// Cascade-delete every row belonging to a project, the project last.
    pub async fn delete_project(&self, project_id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        if projects::get(&mut tx, project_id).await?.is_none() {
            return Err(Error::NotFound(format!("Project not found: {project_id}")));
        }

        tasks::delete_for_project(&mut tx, project_id).await?;
        events::delete_for_project(&mut tx, project_id).await?;
        steps::delete_for_project(&mut tx, project_id).await?;
        watch::delete_for_project(&mut tx, project_id).await?;
        projects::delete(&mut tx, project_id).await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_watch_progress(
        &self,
        project_id: Uuid,
        viewer_id: &str,
        position_sec: f64,
        duration_sec: f64,
    ) -> Result<WatchProgress> {
        let mut conn = self.pool.acquire().await?;
        if projects::get(&mut conn, project_id).await?.is_none() {
            return Err(Error::NotFound(format!("Project not found: {project_id}")));
        }
        watch::upsert(&mut conn, project_id, viewer_id, position_sec, duration_sec).await
    }

    /// Append a standalone event row. Message is bounded to
    /// [`MAX_EVENT_MESSAGE_CHARS`] with a truncation marker.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_task_event(
        &self,
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
        let mut conn = self.pool.acquire().await?;
        events::append(
            &mut conn,
            task_id,
            project_id,
            step,
            event_type,
            level,
            message,
            percent,
            duration_ms,
            error_message,
        )
        .await
    }
}

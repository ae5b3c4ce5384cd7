//! Pipeline runner
//!
//! In-memory FIFO queue feeding a single consumer task. Enqueue is
//! idempotent by task id; exactly one task executes at a time. Cancellation
//! is cooperative: the runner checks the store-backed predicate at every
//! safe point (top of each step, after each step, and inside subprocess
//! supervision via the step context's cancel hook).

pub mod steps;

use crate::config::{Config, PipelineMode};
use crate::db::{ProjectPatch, Store, TaskProgressUpdate};
use crate::logging::TaskLogger;
use crate::models::{
    EventLevel, EventType, ProjectStatus, StepStatus, TaskStatus, TaskStepState,
};
use crate::services::asr::{DashScopeSpeechRecognizer, MockSpeechRecognizer, SpeechRecognizer};
use crate::services::translate::{
    GeminiSubtitleTranslator, MockSubtitleTranslator, SubtitleTranslator,
};
use crate::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use steps::{StepContext, StepId};
use tokio::sync::mpsc;
use uuid::Uuid;

const CANCELED_BY_USER: &str = "Task canceled by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueItem {
    pub task_id: Uuid,
    pub project_id: Uuid,
}

pub struct PipelineRunner {
    store: Store,
    config: Arc<Config>,
    asr: Arc<dyn SpeechRecognizer>,
    translator: Arc<dyn SubtitleTranslator>,
    tx: mpsc::UnboundedSender<QueueItem>,
    queued: Mutex<HashSet<Uuid>>,
    running: AtomicBool,
}

impl PipelineRunner {
    /// Run the interrupted-task sweep, then start the consumer loop.
    pub async fn start(store: Store, config: Arc<Config>) -> Result<Arc<Self>> {
        Self::recover_interrupted(&store).await?;

        let (asr, translator): (Arc<dyn SpeechRecognizer>, Arc<dyn SubtitleTranslator>) =
            match config.pipeline_mode {
                PipelineMode::Mock => (Arc::new(MockSpeechRecognizer), Arc::new(MockSubtitleTranslator)),
                PipelineMode::Live => (
                    Arc::new(DashScopeSpeechRecognizer::from_config(&config)?),
                    Arc::new(GeminiSubtitleTranslator::from_config(&config)?),
                ),
            };

        let (tx, rx) = mpsc::unbounded_channel();
        let runner = Arc::new(Self {
            store,
            config,
            asr,
            translator,
            tx,
            queued: Mutex::new(HashSet::new()),
            running: AtomicBool::new(false),
        });

        tokio::spawn(Self::consume(Arc::clone(&runner), rx));
        Ok(runner)
    }

    /// Idempotent by task id: a task already waiting is not queued twice.
    pub fn enqueue(&self, item: QueueItem) {
        {
            let mut queued = self.queued.lock().expect("queued set poisoned");
            if !queued.insert(item.task_id) {
                tracing::debug!(task_id = %item.task_id, "Task already queued");
                return;
            }
        }
        if self.tx.send(item).is_err() {
            tracing::error!(task_id = %item.task_id, "Runner consumer is gone; dropping enqueue");
            self.queued
                .lock()
                .expect("queued set poisoned")
                .remove(&item.task_id);
        }
    }

    /// Whether a task is executing right now.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn consume(runner: Arc<Self>, mut rx: mpsc::UnboundedReceiver<QueueItem>) {
        while let Some(item) = rx.recv().await {
            runner.running.store(true, Ordering::SeqCst);
            // Failures are already persisted as task state and events.
            if let Err(e) = runner.run_one(item).await {
                tracing::error!(task_id = %item.task_id, error = %e, "Task execution failed");
            }
            runner
                .queued
                .lock()
                .expect("queued set poisoned")
                .remove(&item.task_id);
            runner.running.store(false, Ordering::SeqCst);
        }
    }

    /// Startup sweep over tasks the previous process left non-terminal.
    /// Nothing is re-enqueued; a human retries explicitly.
    pub async fn recover_interrupted(store: &Store) -> Result<()> {
        let interrupted = store.get_interrupted_tasks().await?;
        for task in interrupted {
            match task.status {
                TaskStatus::Running => {
                    tracing::warn!(
                        task_id = %task.task_id,
                        step = %task.current_step,
                        "Failing task interrupted by restart"
                    );
                    store
                        .update_task_progress(
                            task.task_id,
                            TaskProgressUpdate {
                                status: TaskStatus::Failed,
                                step: &task.current_step,
                                percent: task.progress_percent,
                                message: "Task execution interrupted by server restart",
                                event_type: Some(EventType::Error),
                                level: Some(EventLevel::Error),
                                error_message: Some(
                                    "Server restart detected while task was running",
                                ),
                                duration_ms: None,
                            },
                        )
                        .await?;
                    store
                        .update_project_from_pipeline(
                            task.project_id,
                            ProjectPatch::status(ProjectStatus::Failed),
                        )
                        .await?;
                }
                TaskStatus::Canceling => {
                    tracing::warn!(
                        task_id = %task.task_id,
                        "Finishing cancellation requested before restart"
                    );
                    store
                        .mark_task_canceled(
                            task.task_id,
                            "Task canceled by user (processed after restart)",
                            &task.current_step,
                            task.progress_percent,
                        )
                        .await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn load_states(&self, task_id: Uuid) -> Result<HashMap<String, TaskStepState>> {
        Ok(self
            .store
            .get_task_step_states(task_id)
            .await?
            .into_iter()
            .map(|state| (state.step.clone(), state))
            .collect())
    }

    async fn run_one(&self, item: QueueItem) -> Result<()> {
        let Some(task) = self.store.find_task(item.task_id).await? else {
            tracing::warn!(task_id = %item.task_id, "Queued task no longer exists");
            return Ok(());
        };
        if task.status == TaskStatus::Canceled {
            tracing::info!(task_id = %item.task_id, "Skipping task canceled while queued");
            return Ok(());
        }

        let Some(project) = self.store.find_project(item.project_id).await? else {
            self.store
                .update_task_progress(
                    item.task_id,
                    TaskProgressUpdate {
                        status: TaskStatus::Failed,
                        step: &task.current_step,
                        percent: task.progress_percent,
                        message: "Project row is missing",
                        event_type: Some(EventType::Error),
                        level: Some(EventLevel::Error),
                        error_message: Some("Project row is missing"),
                        duration_ms: None,
                    },
                )
                .await?;
            return Ok(());
        };

        let project_dir = self.config.project_dir(&item.project_id);
        std::fs::create_dir_all(&project_dir)?;

        let source_url = crate::models::derive_source_url(
            project.source,
            &project.source_video_id,
            &project.original_input,
        );

        let mut cx = StepContext {
            task_id: item.task_id,
            project_id: item.project_id,
            project,
            store: self.store.clone(),
            config: Arc::clone(&self.config),
            asr: Arc::clone(&self.asr),
            translator: Arc::clone(&self.translator),
            video_path: project_dir.join("video.mp4"),
            audio_path: project_dir.join("audio.opus"),
            metadata_path: project_dir.join("metadata.info.json"),
            asr_json_path: project_dir.join("asr.json"),
            asr_srt_path: project_dir.join("asr.srt"),
            asr_vtt_path: project_dir.join("asr.vtt"),
            translated_srt_path: project_dir.join("video.srt"),
            translated_vtt_path: project_dir.join("video.vtt"),
            project_dir,
            source_url,
            states: self.load_states(item.task_id).await?,
        };

        let base_logger = TaskLogger::new(
            self.store.clone(),
            item.task_id,
            item.project_id,
            task.current_step.clone(),
            task.progress_percent,
        );

        let mut current_percent = task.progress_percent;

        for step in StepId::ALL {
            if self.store.is_task_cancel_requested(item.task_id).await? {
                self.store
                    .mark_task_canceled(item.task_id, CANCELED_BY_USER, step.id(), current_percent)
                    .await?;
                return Ok(());
            }

            let logger = base_logger.with_step(step.id(), step.percent());

            if cx
                .states
                .get(step.id())
                .is_some_and(|s| s.status == StepStatus::Completed)
            {
                logger
                    .debug(&format!("Step already completed, skipping: {}", step.id()))
                    .await;
                continue;
            }

            self.store
                .update_project_from_pipeline(
                    item.project_id,
                    ProjectPatch::status(step.project_status()),
                )
                .await?;
            self.store
                .update_task_progress(
                    item.task_id,
                    TaskProgressUpdate {
                        status: TaskStatus::Running,
                        step: step.id(),
                        percent: step.percent(),
                        message: step.message(),
                        event_type: None,
                        level: None,
                        error_message: None,
                        duration_ms: None,
                    },
                )
                .await?;

            self.store
                .mark_step_start(item.task_id, item.project_id, step.id())
                .await?;
            self.store
                .append_task_event(
                    item.task_id,
                    item.project_id,
                    step.id(),
                    EventType::StepStart,
                    EventLevel::Info,
                    &format!("Step started: {}", step.id()),
                    Some(step.percent()),
                    None,
                    None,
                )
                .await?;

            match steps::run_step(step, &cx, &logger).await {
                Ok(output) => {
                    let duration_ms = self
                        .store
                        .mark_step_end(
                            item.task_id,
                            step.id(),
                            StepStatus::Completed,
                            None,
                            Some(&output),
                        )
                        .await?;
                    self.store
                        .append_task_event(
                            item.task_id,
                            item.project_id,
                            step.id(),
                            EventType::StepEnd,
                            EventLevel::Info,
                            &format!("Step completed: {}", step.id()),
                            Some(step.percent()),
                            Some(duration_ms),
                            None,
                        )
                        .await?;
                    cx.states = self.load_states(item.task_id).await?;
                }
                // A kill inside the supervisor surfaces here. The step row
                // stays `running` with its attempt intact so a retry resumes
                // cleanly.
                Err(Error::Canceled(reason)) => {
                    logger.warn(&reason).await;
                    self.store
                        .mark_task_canceled(
                            item.task_id,
                            CANCELED_BY_USER,
                            step.id(),
                            step.percent(),
                        )
                        .await?;
                    return Ok(());
                }
                Err(err) => {
                    let message = err.to_string();
                    self.store
                        .mark_step_end(
                            item.task_id,
                            step.id(),
                            StepStatus::Failed,
                            Some(&message),
                            None,
                        )
                        .await?;
                    self.store
                        .update_project_from_pipeline(
                            item.project_id,
                            ProjectPatch::status(ProjectStatus::Failed),
                        )
                        .await?;
                    self.store
                        .update_task_progress(
                            item.task_id,
                            TaskProgressUpdate {
                                status: TaskStatus::Failed,
                                step: step.id(),
                                percent: step.percent(),
                                message: &format!("Step failed: {}", step.id()),
                                event_type: Some(EventType::Error),
                                level: Some(EventLevel::Error),
                                error_message: Some(&message),
                                duration_ms: None,
                            },
                        )
                        .await?;
                    logger
                        .error(&format!("Step {} failed: {message}", step.id()), Some(&message))
                        .await;
                    return Ok(());
                }
            }

            current_percent = step.percent();

            if self.store.is_task_cancel_requested(item.task_id).await? {
                self.store
                    .mark_task_canceled(item.task_id, CANCELED_BY_USER, step.id(), current_percent)
                    .await?;
                return Ok(());
            }
        }

        self.store
            .update_task_progress(
                item.task_id,
                TaskProgressUpdate {
                    status: TaskStatus::Completed,
                    step: "done",
                    percent: 100,
                    message: "Pipeline completed",
                    event_type: None,
                    level: None,
                    error_message: None,
                    duration_ms: None,
                },
            )
            .await?;

        tracing::info!(task_id = %item.task_id, project_id = %item.project_id, "Pipeline completed");
        Ok(())
    }
}

//! Step-scoped task logger
//!
//! Every call emits one console line through `tracing` (the fmt subscriber
//! supplies timestamps, level colouring and the structured task/step
//! fields) and appends one durable task event with the same step and
//! percent. The logger is stateless and cheap to clone; steps get a fresh
//! one via [`TaskLogger::with_step`].
//!
//! Event-log write failures are reported to the console and swallowed:
//! losing one history row must not fail the step that logged it.

use crate::db::{bound_message, Store};
use crate::models::{EventLevel, EventType};
use uuid::Uuid;

#[derive(Clone)]
pub struct TaskLogger {
    store: Store,
    task_id: Uuid,
    project_id: Uuid,
    step: String,
    percent: i64,
}

impl TaskLogger {
    pub fn new(
        store: Store,
        task_id: Uuid,
        project_id: Uuid,
        step: impl Into<String>,
        percent: i64,
    ) -> Self {
        Self {
            store,
            task_id,
            project_id,
            step: step.into(),
            percent,
        }
    }

    /// A copy of this logger scoped to another step.
    pub fn with_step(&self, step: impl Into<String>, percent: i64) -> Self {
        Self {
            store: self.store.clone(),
            task_id: self.task_id,
            project_id: self.project_id,
            step: step.into(),
            percent,
        }
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub async fn trace(&self, message: &str) {
        self.emit(EventLevel::Trace, message, None).await;
    }

    pub async fn debug(&self, message: &str) {
        self.emit(EventLevel::Debug, message, None).await;
    }

    pub async fn info(&self, message: &str) {
        self.emit(EventLevel::Info, message, None).await;
    }

    pub async fn warn(&self, message: &str) {
        self.emit(EventLevel::Warn, message, None).await;
    }

    pub async fn error(&self, message: &str, error_message: Option<&str>) {
        self.emit(EventLevel::Error, message, error_message).await;
    }

    async fn emit(&self, level: EventLevel, message: &str, error_message: Option<&str>) {
        let message = bound_message(message);

        match level {
            EventLevel::Trace => {
                tracing::trace!(task_id = %self.task_id, step = %self.step, "{message}")
            }
            EventLevel::Debug => {
                tracing::debug!(task_id = %self.task_id, step = %self.step, "{message}")
            }
            EventLevel::Info => {
                tracing::info!(task_id = %self.task_id, step = %self.step, "{message}")
            }
            EventLevel::Warn => {
                tracing::warn!(task_id = %self.task_id, step = %self.step, "{message}")
            }
            EventLevel::Error => {
                tracing::error!(task_id = %self.task_id, step = %self.step, "{message}")
            }
        }

        let event_type = if level == EventLevel::Error {
            EventType::Error
        } else {
            EventType::Log
        };

        if let Err(e) = self
            .store
            .append_task_event(
                self.task_id,
                self.project_id,
                &self.step,
                event_type,
                level,
                &message,
                Some(self.percent),
                None,
                error_message,
            )
            .await
        {
            tracing::warn!(task_id = %self.task_id, error = %e, "Failed to append task event");
        }
    }
}

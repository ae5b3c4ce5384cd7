//! Store invariants: submission, cancellation, retry, checkpoints, events,
//! watch progress and the delete cascade.

mod helpers;

use grillmaster::db::{ProjectPatch, Store, TaskProgressUpdate};
use grillmaster::models::{
    EventLevel, EventType, ProjectStatus, StepStatus, TaskStatus, VideoSource,
};
use grillmaster::Error;
use helpers::create_test_store;
use uuid::Uuid;

async fn submit_bilibili(store: &Store) -> (Uuid, Uuid) {
    let outcome = store
        .submit_project(
            VideoSource::Bilibili,
            "BV18KBJBeEmV",
            "BV18KBJBeEmV",
            Some("variety show"),
        )
        .await
        .unwrap();
    (outcome.project_id, outcome.task_id)
}

fn running_update<'a>() -> TaskProgressUpdate<'a> {
    TaskProgressUpdate {
        status: TaskStatus::Running,
        step: "fetch_metadata",
        percent: 10,
        message: "Fetching video metadata",
        event_type: None,
        level: None,
        error_message: None,
        duration_ms: None,
    }
}

#[tokio::test]
async fn submit_creates_project_task_and_initial_event() {
    let (_dir, store) = create_test_store().await;
    let (project_id, task_id) = submit_bilibili(&store).await;

    let (project, tasks) = store.get_project(project_id).await.unwrap();
    assert_eq!(project.source, VideoSource::Bilibili);
    assert_eq!(project.source_video_id, "BV18KBJBeEmV");
    assert_eq!(project.status, ProjectStatus::Queued);
    assert_eq!(project.translation_hint.as_deref(), Some("variety show"));
    assert_eq!(project.llm_cost_twd, 0.0);
    assert_eq!(tasks.len(), 1);

    let (task, events) = store.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.current_step, "submit");
    assert_eq!(task.progress_percent, 0);
    assert_eq!(task.task_type, "pipeline");
    assert!(task.started_at.is_none());
    assert!(task.finished_at.is_none());

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::System);
    assert_eq!(events[0].level, EventLevel::Info);
}

#[tokio::test]
async fn duplicate_submission_conflicts_without_side_effects() {
    let (_dir, store) = create_test_store().await;
    submit_bilibili(&store).await;

    let err = store
        .submit_project(VideoSource::Bilibili, "BV18KBJBeEmV", "BV18KBJBeEmV", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "{err}");

    assert_eq!(store.list_projects(200).await.unwrap().len(), 1);
    assert_eq!(store.list_tasks(100).await.unwrap().len(), 1);
}

#[tokio::test]
async fn same_video_id_on_another_source_is_not_a_conflict() {
    let (_dir, store) = create_test_store().await;
    submit_bilibili(&store).await;

    store
        .submit_project(VideoSource::Unknown, "BV18KBJBeEmV", "BV18KBJBeEmV", None)
        .await
        .expect("different source must not conflict");
}

#[tokio::test]
async fn step_start_bumps_attempt_on_the_same_row() {
    let (_dir, store) = create_test_store().await;
    let (project_id, task_id) = submit_bilibili(&store).await;

    store
        .mark_step_start(task_id, project_id, "fetch_metadata")
        .await
        .unwrap();
    store
        .mark_step_start(task_id, project_id, "fetch_metadata")
        .await
        .unwrap();

    let states = store.get_task_step_states(task_id).await.unwrap();
    assert_eq!(states.len(), 1, "unique (task_id, step) is one row");
    assert_eq!(states[0].attempt, 2);
    assert_eq!(states[0].status, StepStatus::Running);
    assert!(states[0].finished_at.is_none());
}

#[tokio::test]
async fn step_end_records_duration_and_output() {
    let (_dir, store) = create_test_store().await;
    let (project_id, task_id) = submit_bilibili(&store).await;

    store
        .mark_step_start(task_id, project_id, "fetch_metadata")
        .await
        .unwrap();
    let output = serde_json::json!({ "title": "t" });
    let duration = store
        .mark_step_end(
            task_id,
            "fetch_metadata",
            StepStatus::Completed,
            None,
            Some(&output),
        )
        .await
        .unwrap();
    assert!(duration >= 0);

    let states = store.get_task_step_states(task_id).await.unwrap();
    assert_eq!(states[0].status, StepStatus::Completed);
    assert_eq!(states[0].duration_ms, Some(duration));
    let stored: serde_json::Value =
        serde_json::from_str(states[0].output_json.as_ref().unwrap()).unwrap();
    assert_eq!(stored, output);
}

#[tokio::test]
async fn retry_resets_only_non_completed_steps() {
    let (_dir, store) = create_test_store().await;
    let (project_id, task_id) = submit_bilibili(&store).await;

    // fetch_metadata completes, run_asr fails, extract_audio is left
    // running as a crash would leave it.
    for step in ["fetch_metadata", "run_asr", "extract_audio"] {
        store.mark_step_start(task_id, project_id, step).await.unwrap();
    }
    let output = serde_json::json!({ "title": "kept" });
    store
        .mark_step_end(
            task_id,
            "fetch_metadata",
            StepStatus::Completed,
            None,
            Some(&output),
        )
        .await
        .unwrap();
    store
        .mark_step_end(task_id, "run_asr", StepStatus::Failed, Some("boom"), None)
        .await
        .unwrap();

    let (retry_task_id, retry_project_id) = store.retry_task(task_id).await.unwrap();
    assert_eq!(retry_task_id, task_id);
    assert_eq!(retry_project_id, project_id);

    let states = store.get_task_step_states(task_id).await.unwrap();
    let by_step = |name: &str| states.iter().find(|s| s.step == name).unwrap();

    let kept = by_step("fetch_metadata");
    assert_eq!(kept.status, StepStatus::Completed);
    assert!(kept.output_json.is_some(), "completed checkpoint survives");
    assert!(kept.finished_at.is_some());

    let failed = by_step("run_asr");
    assert_eq!(failed.status, StepStatus::Pending);
    assert!(failed.started_at.is_none());
    assert!(failed.error_message.is_none());
    assert_eq!(failed.attempt, 1, "attempt count is preserved across retry");

    // A row left `running` by a crash is non-completed and is reset too.
    let crashed = by_step("extract_audio");
    assert_eq!(crashed.status, StepStatus::Pending);
    assert!(crashed.started_at.is_none());

    let (task, _) = store.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.current_step, "retry");
    assert_eq!(task.progress_percent, 0);
    assert!(task.error_message.is_none());
    assert!(task.finished_at.is_none());

    let (project, _) = store.get_project(project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Queued);
}

#[tokio::test]
async fn cancel_on_queued_task_is_immediate() {
    let (_dir, store) = create_test_store().await;
    let (project_id, task_id) = submit_bilibili(&store).await;

    let status = store.request_task_cancel(task_id).await.unwrap();
    assert_eq!(status, TaskStatus::Canceled);

    let (task, events) = store.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
    assert!(task.canceled_at.is_some());
    assert!(task.finished_at.is_some());

    let (project, _) = store.get_project(project_id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Canceled);

    assert!(events
        .iter()
        .any(|e| e.level == EventLevel::Warn && e.message.to_lowercase().contains("canceled")));
}

#[tokio::test]
async fn cancel_on_running_task_requests_and_leaves_steps_alone() {
    let (_dir, store) = create_test_store().await;
    let (project_id, task_id) = submit_bilibili(&store).await;

    store
        .update_task_progress(task_id, running_update())
        .await
        .unwrap();
    store
        .mark_step_start(task_id, project_id, "download_video")
        .await
        .unwrap();

    let status = store.request_task_cancel(task_id).await.unwrap();
    assert_eq!(status, TaskStatus::Canceling);
    assert!(store.is_task_cancel_requested(task_id).await.unwrap());

    // The step row is untouched by the cancel request.
    let states = store.get_task_step_states(task_id).await.unwrap();
    let step = states.iter().find(|s| s.step == "download_video").unwrap();
    assert_eq!(step.status, StepStatus::Running);
    assert_eq!(step.attempt, 1);

    // The runner finalizes at the next safe point.
    store
        .mark_task_canceled(task_id, "Task canceled by user", "download_video", 25)
        .await
        .unwrap();

    let (task, events) = store.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
    assert_eq!(task.current_step, "download_video");
    assert_eq!(task.progress_percent, 25);
    assert!(events
        .iter()
        .any(|e| e.level == EventLevel::Warn && e.message.contains("canceled")));

    // Step row still running with its attempt intact after finalization.
    let states = store.get_task_step_states(task_id).await.unwrap();
    let step = states.iter().find(|s| s.step == "download_video").unwrap();
    assert_eq!(step.status, StepStatus::Running);
    assert_eq!(step.attempt, 1);
}

#[tokio::test]
async fn cancel_on_terminal_task_is_a_no_op() {
    let (_dir, store) = create_test_store().await;
    let (_, task_id) = submit_bilibili(&store).await;

    store
        .update_task_progress(
            task_id,
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
        .await
        .unwrap();

    let status = store.request_task_cancel(task_id).await.unwrap();
    assert_eq!(status, TaskStatus::Completed);

    let (task, _) = store.get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.canceled_at.is_none());
}

#[tokio::test]
async fn cancel_request_is_monotone_until_retry_clears_it() {
    let (_dir, store) = create_test_store().await;
    let (_, task_id) = submit_bilibili(&store).await;

    assert!(!store.is_task_cancel_requested(task_id).await.unwrap());

    store
        .update_task_progress(task_id, running_update())
        .await
        .unwrap();
    store.request_task_cancel(task_id).await.unwrap();

    for _ in 0..3 {
        assert!(store.is_task_cancel_requested(task_id).await.unwrap());
    }

    store.retry_task(task_id).await.unwrap();
    assert!(!store.is_task_cancel_requested(task_id).await.unwrap());
}

#[tokio::test]
async fn task_timestamps_follow_status_transitions() {
    let (_dir, store) = create_test_store().await;
    let (_, task_id) = submit_bilibili(&store).await;

    store
        .update_task_progress(task_id, running_update())
        .await
        .unwrap();
    let (task, _) = store.get_task(task_id).await.unwrap();
    let started_at = task.started_at.expect("set on first running transition");
    assert!(task.finished_at.is_none(), "finished_at only when terminal");

    store
        .update_task_progress(
            task_id,
            TaskProgressUpdate {
                status: TaskStatus::Running,
                step: "download_video",
                percent: 25,
                message: "Downloading video",
                event_type: None,
                level: None,
                error_message: None,
                duration_ms: None,
            },
        )
        .await
        .unwrap();
    let (task, _) = store.get_task(task_id).await.unwrap();
    assert_eq!(task.started_at, Some(started_at), "started_at set once");

    store
        .update_task_progress(
            task_id,
            TaskProgressUpdate {
                status: TaskStatus::Failed,
                step: "download_video",
                percent: 25,
                message: "Step failed: download_video",
                event_type: Some(EventType::Error),
                level: Some(EventLevel::Error),
                error_message: Some("network gone"),
                duration_ms: None,
            },
        )
        .await
        .unwrap();
    let (task, _) = store.get_task(task_id).await.unwrap();
    let finished_at = task.finished_at.expect("terminal status sets finished_at");
    assert!(finished_at >= started_at);
    assert_eq!(task.error_message.as_deref(), Some("network gone"));
}

#[tokio::test]
async fn update_task_progress_on_missing_task_is_not_found() {
    let (_dir, store) = create_test_store().await;
    let err = store
        .update_task_progress(Uuid::new_v4(), running_update())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{err}");
}

#[tokio::test]
async fn events_are_append_only_and_ordered() {
    let (_dir, store) = create_test_store().await;
    let (project_id, task_id) = submit_bilibili(&store).await;

    for i in 0..10 {
        store
            .append_task_event(
                task_id,
                project_id,
                "fetch_metadata",
                EventType::Log,
                EventLevel::Info,
                &format!("line {i}"),
                Some(10),
                None,
                None,
            )
            .await
            .unwrap();
    }

    let (_, events) = store.get_task(task_id).await.unwrap();
    assert_eq!(events.len(), 11, "submit event plus ten appended");

    // Newest first: created_at non-increasing, rowid strictly decreasing.
    for pair in events.windows(2) {
        assert!(pair[0].created_at >= pair[1].created_at);
        assert!(pair[0].id > pair[1].id);
    }
}

#[tokio::test]
async fn long_event_messages_are_bounded() {
    let (_dir, store) = create_test_store().await;
    let (project_id, task_id) = submit_bilibili(&store).await;

    let long = "y".repeat(2000);
    store
        .append_task_event(
            task_id,
            project_id,
            "run_asr",
            EventType::Log,
            EventLevel::Debug,
            &long,
            Some(55),
            None,
            None,
        )
        .await
        .unwrap();

    let (_, events) = store.get_task(task_id).await.unwrap();
    let stored = &events[0].message;
    assert!(stored.ends_with("...[truncated 400 chars]"), "{stored}");
    assert_eq!(stored.chars().count(), 1600 + "...[truncated 400 chars]".len());
}

#[tokio::test]
async fn partial_project_updates_leave_other_fields_alone() {
    let (_dir, store) = create_test_store().await;
    let (project_id, _) = submit_bilibili(&store).await;

    store
        .update_project_from_pipeline(
            project_id,
            ProjectPatch {
                title: Some("Great Show".into()),
                ..ProjectPatch::default()
            },
        )
        .await
        .unwrap();

    let (project, _) = store.get_project(project_id).await.unwrap();
    assert_eq!(project.title.as_deref(), Some("Great Show"));
    assert_eq!(project.status, ProjectStatus::Queued, "status untouched");
    assert_eq!(project.translation_hint.as_deref(), Some("variety show"));
}

#[tokio::test]
async fn interrupted_tasks_are_the_running_and_canceling_ones() {
    let (_dir, store) = create_test_store().await;
    let (_, running_id) = submit_bilibili(&store).await;
    let other = store
        .submit_project(VideoSource::Youtube, "dQw4w9WgXcQ", "dQw4w9WgXcQ", None)
        .await
        .unwrap();

    store
        .update_task_progress(running_id, running_update())
        .await
        .unwrap();
    store
        .update_task_progress(other.task_id, running_update())
        .await
        .unwrap();
    store.request_task_cancel(other.task_id).await.unwrap();

    let interrupted = store.get_interrupted_tasks().await.unwrap();
    assert_eq!(interrupted.len(), 2);
    assert!(interrupted.iter().any(|t| t.task_id == running_id));
    assert!(interrupted
        .iter()
        .any(|t| t.task_id == other.task_id && t.status == TaskStatus::Canceling));
}

#[tokio::test]
async fn watch_progress_upserts_per_viewer() {
    let (_dir, store) = create_test_store().await;
    let (project_id, _) = submit_bilibili(&store).await;

    store
        .upsert_watch_progress(project_id, "viewer-a", 10.0, 600.0)
        .await
        .unwrap();
    let updated = store
        .upsert_watch_progress(project_id, "viewer-a", 42.5, 600.0)
        .await
        .unwrap();
    assert_eq!(updated.position_sec, 42.5);
    store
        .upsert_watch_progress(project_id, "viewer-b", 5.0, 600.0)
        .await
        .unwrap();

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM watch_progress WHERE project_id = ?")
            .bind(project_id.to_string())
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(count, 2);

    let position: f64 = sqlx::query_scalar(
        "SELECT position_sec FROM watch_progress WHERE project_id = ? AND viewer_id = 'viewer-a'",
    )
    .bind(project_id.to_string())
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(position, 42.5);
}

#[tokio::test]
async fn watch_progress_for_missing_project_is_not_found() {
    let (_dir, store) = create_test_store().await;
    let err = store
        .upsert_watch_progress(Uuid::new_v4(), "viewer", 0.0, 10.0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{err}");
}

#[tokio::test]
async fn delete_project_cascades_every_table() {
    let (_dir, store) = create_test_store().await;
    let (project_id, task_id) = submit_bilibili(&store).await;

    store
        .update_task_progress(task_id, running_update())
        .await
        .unwrap();
    store
        .mark_step_start(task_id, project_id, "fetch_metadata")
        .await
        .unwrap();
    store
        .upsert_watch_progress(project_id, "viewer-a", 3.0, 100.0)
        .await
        .unwrap();

    store.delete_project(project_id).await.unwrap();

    assert!(matches!(
        store.get_project(project_id).await.unwrap_err(),
        Error::NotFound(_)
    ));

    for table in ["tasks", "task_events", "task_step_states", "watch_progress"] {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE project_id = ?"))
                .bind(project_id.to_string())
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(count, 0, "{table} not emptied");
    }
}

#[tokio::test]
async fn delete_missing_project_is_not_found() {
    let (_dir, store) = create_test_store().await;
    let err = store.delete_project(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "{err}");
}

#[tokio::test]
async fn listings_include_the_latest_task_and_respect_limits() {
    let (_dir, store) = create_test_store().await;
    let (project_id, task_id) = submit_bilibili(&store).await;
    store
        .submit_project(VideoSource::Youtube, "dQw4w9WgXcQ", "dQw4w9WgXcQ", None)
        .await
        .unwrap();

    let projects = store.list_projects(200).await.unwrap();
    assert_eq!(projects.len(), 2);
    let entry = projects
        .iter()
        .find(|p| p.project.project_id == project_id)
        .unwrap();
    assert_eq!(entry.latest_task.as_ref().unwrap().task_id, task_id);

    assert_eq!(store.list_tasks(1).await.unwrap().len(), 1);
}

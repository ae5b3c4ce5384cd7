//! Shared test utilities
//!
//! Each test gets its own temporary directory holding the SQLite file and
//! the projects tree; the TempDir must outlive the store.

use grillmaster::config::Config;
use grillmaster::db::{init_database, Store};
use grillmaster::models::TaskStatus;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub async fn create_test_store() -> (TempDir, Store) {
    let temp_dir = TempDir::new().unwrap();
    let pool = init_database(&temp_dir.path().join("test.db"))
        .await
        .unwrap();
    (temp_dir, Store::new(pool))
}

/// Mock-mode config rooted in the test's temp directory.
#[allow(dead_code)]
pub fn test_config(temp_dir: &TempDir) -> Arc<Config> {
    Arc::new(Config {
        sqlite_db_path: temp_dir.path().join("test.db"),
        projects_dir: temp_dir.path().join("projects"),
        ..Config::default()
    })
}

/// Poll until the task reaches `status` or the deadline passes.
#[allow(dead_code)]
pub async fn wait_for_task_status(store: &Store, task_id: Uuid, status: TaskStatus) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let task = store
            .find_task(task_id)
            .await
            .unwrap()
            .expect("task exists");
        if task.status == status {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "task {task_id} did not reach {status:?}; last seen {:?} at step {} ({})",
            task.status,
            task.current_step,
            task.message,
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

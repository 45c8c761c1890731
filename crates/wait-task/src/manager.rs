//! Registry of the wait tasks running against one execution context.

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info};

use crate::errors::WaitError;
use crate::task::{TaskId, WaitTask};

/// Tracks in-flight tasks for bulk termination and re-runs.
///
/// Holds tasks by id; tasks keep only a weak reference back and remove themselves on
/// termination.
#[derive(Default)]
pub struct TaskManager {
    tasks: DashMap<TaskId, WaitTask>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, task: WaitTask) -> bool {
        self.tasks.insert(task.id(), task).is_none()
    }

    pub fn delete(&self, id: &TaskId) -> bool {
        self.tasks.remove(id).is_some()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Terminates every registered task with `error`. Used when the context is gone for good.
    pub async fn terminate_all(&self, error: WaitError) {
        let tasks = self.snapshot();
        if !tasks.is_empty() {
            info!(count = tasks.len(), %error, "terminating wait tasks");
        }
        join_all(
            tasks
                .iter()
                .map(|task| task.terminate(Some(error.clone()))),
        )
        .await;
        self.tasks.clear();
    }

    /// Re-runs every registered task against the current context and waits until each
    /// reaches a stable point.
    pub async fn rerun_all(&self) {
        let tasks = self.snapshot();
        if tasks.is_empty() {
            return;
        }
        debug!(count = tasks.len(), "re-running wait tasks");
        join_all(tasks.iter().map(|task| task.rerun())).await;
    }

    fn snapshot(&self) -> Vec<WaitTask> {
        self.tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

//! Task Board Seam
//!
//! The board is owned by whoever embeds the live session (a UI, the CLI, a
//! test). The session never caches tasks: every tool call goes through this
//! trait so it always observes the board as it is right now.

use crate::task::{NewTask, Task, TaskStatus, find_task};
use std::sync::Mutex;
use tracing::{info, warn};

/// Operations the embedding application exposes to the tool dispatcher.
///
/// Implementations run inline with tool dispatch, so they must be fast,
/// in-memory operations rather than long-running I/O.
#[cfg_attr(test, mockall::automock)]
pub trait TaskBoard: Send + Sync {
    /// Adds a new pending task.
    fn add_task(&self, task: NewTask);

    /// Marks the task with the given id (or matching title) as completed.
    fn complete_task(&self, title_or_id: &str);

    /// Returns a snapshot of every task currently on the board.
    fn tasks(&self) -> Vec<Task>;
}

/// A `TaskBoard` that keeps tasks in process memory.
#[derive(Debug, Default)]
pub struct MemoryTaskBoard {
    tasks: Mutex<Vec<Task>>,
}

impl MemoryTaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a board pre-populated with existing tasks.
    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Task>> {
        // A panic while holding the lock leaves the list itself intact.
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TaskBoard for MemoryTaskBoard {
    fn add_task(&self, task: NewTask) {
        let task = Task::from_new(task);
        info!(id = %task.id, title = %task.title, category = ?task.category, "Task added");
        self.lock().push(task);
    }

    fn complete_task(&self, title_or_id: &str) {
        let mut tasks = self.lock();
        let Some(id) = find_task(&tasks, title_or_id).map(|t| t.id.clone()) else {
            warn!(query = %title_or_id, "No task matched completion request");
            return;
        };
        if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
            task.status = TaskStatus::Completed;
            info!(id = %task.id, title = %task.title, "Task completed");
        }
    }

    fn tasks(&self) -> Vec<Task> {
        self.lock().clone()
    }
}

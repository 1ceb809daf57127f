use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Completion state of a task on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Completed,
}

/// The column a task is filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskCategory {
    Work,
    #[default]
    Personal,
    Idea,
    Meeting,
}

impl TaskCategory {
    /// Parses a category the way the assistant tends to say it, falling back
    /// to `Personal` for anything unrecognised.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }
}

impl FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "work" => Ok(TaskCategory::Work),
            "personal" => Ok(TaskCategory::Personal),
            "idea" => Ok(TaskCategory::Idea),
            "meeting" => Ok(TaskCategory::Meeting),
            other => Err(format!("unknown task category '{other}'")),
        }
    }
}

/// A single entry on the task board.
///
/// Tasks are owned by the board; the live session only ever reads snapshots
/// of them and asks the board to mutate them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub category: TaskCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Materialises a pending task from the partial fields supplied by a tool call.
    pub fn from_new(new_task: NewTask) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: new_task.title,
            status: TaskStatus::Pending,
            category: new_task.category.unwrap_or_default(),
            time: new_task.time,
            location: new_task.location,
            description: new_task.description,
            notes: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// The partial task fields handed to [`crate::board::TaskBoard::add_task`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewTask {
    pub title: String,
    pub time: Option<String>,
    pub description: Option<String>,
    pub category: Option<TaskCategory>,
    pub location: Option<String>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }
}

/// Finds the task a spoken reference points at.
///
/// An exact id wins. Otherwise the title is matched case-insensitively as a
/// substring, preferring pending tasks over completed ones. Blank queries
/// never match.
pub fn find_task<'a>(tasks: &'a [Task], title_or_id: &str) -> Option<&'a Task> {
    let query = title_or_id.trim();
    if query.is_empty() {
        return None;
    }
    if let Some(task) = tasks.iter().find(|t| t.id == query) {
        return Some(task);
    }

    let needle = query.to_lowercase();
    let mut matches = tasks
        .iter()
        .filter(|t| t.title.to_lowercase().contains(&needle));
    let first = matches.next()?;
    if !first.is_completed() {
        return Some(first);
    }
    matches.find(|t| !t.is_completed()).or(Some(first))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, title: &str, status: TaskStatus) -> Task {
        Task {
            status,
            id: id.to_string(),
            ..Task::from_new(NewTask::titled(title))
        }
    }

    #[test]
    fn test_category_parsing_is_case_insensitive() {
        assert_eq!(TaskCategory::parse_lenient("Work"), TaskCategory::Work);
        assert_eq!(TaskCategory::parse_lenient(" MEETING "), TaskCategory::Meeting);
        assert_eq!(TaskCategory::parse_lenient("idea"), TaskCategory::Idea);
        assert_eq!(TaskCategory::parse_lenient("errand"), TaskCategory::Personal);
    }

    #[test]
    fn test_task_serializes_in_camel_case() {
        let mut t = task("t1", "Buy milk", TaskStatus::Pending);
        t.time = Some("5pm".to_string());
        let json = serde_json::to_value(&t).unwrap();

        assert_eq!(json["status"], "pending");
        assert_eq!(json["category"], "personal");
        assert_eq!(json["time"], "5pm");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("location").is_none());
    }

    #[test]
    fn test_task_deserializes_with_defaults() {
        let t: Task = serde_json::from_str(r#"{"id": "a", "title": "Call mom"}"#).unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.category, TaskCategory::Personal);
        assert!(t.notes.is_empty());
    }

    #[test]
    fn test_find_task_by_substring_and_id() {
        let tasks = vec![
            task("t1", "Buy milk", TaskStatus::Pending),
            task("t2", "Email Sarah", TaskStatus::Pending),
        ];

        assert_eq!(find_task(&tasks, "MILK").map(|t| t.id.as_str()), Some("t1"));
        assert_eq!(find_task(&tasks, "t2").map(|t| t.id.as_str()), Some("t2"));
        assert!(find_task(&tasks, "dentist").is_none());
        assert!(find_task(&tasks, "   ").is_none());
    }

    #[test]
    fn test_find_task_prefers_pending_matches() {
        let tasks = vec![
            task("old", "Buy milk", TaskStatus::Completed),
            task("new", "Buy milk again", TaskStatus::Pending),
        ];
        assert_eq!(find_task(&tasks, "milk").map(|t| t.id.as_str()), Some("new"));

        let done = vec![task("old", "Buy milk", TaskStatus::Completed)];
        assert_eq!(find_task(&done, "milk").map(|t| t.id.as_str()), Some("old"));
    }
}

//! Tool Dispatcher
//!
//! Maps the named tool calls issued by the remote assistant onto task-board
//! operations. Dispatch is synchronous and never fails at the session level:
//! unknown tools and bad arguments are answered, not raised.

use crate::{
    board::TaskBoard,
    generic_types::{ToolCallRequest, ToolCallResponse, ToolDeclaration},
    task::{NewTask, TaskCategory, TaskStatus, find_task},
};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{info, warn};

pub const ADD_TASK: &str = "addTask";
pub const MARK_TASK_COMPLETE: &str = "markTaskComplete";
pub const GET_EXISTING_TASKS: &str = "getExistingTasks";

// --- Data Structures for Tools ---

/// Arguments for the `addTask` tool.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct AddTaskArgs {
    /// Short title of the task.
    pub title: String,
    /// When the task is due or happens, as spoken (e.g. "3pm tomorrow").
    pub time: Option<String>,
    /// Extra detail about the task.
    pub description: Option<String>,
    #[schemars(description = "One of 'work', 'personal', 'idea' or 'meeting'")]
    pub category: Option<String>,
}

/// Arguments for the `markTaskComplete` tool.
#[derive(Deserialize, JsonSchema, Debug)]
pub struct MarkTaskCompleteArgs {
    #[schemars(description = "The title (or part of the title) of the task to complete")]
    pub title: String,
}

/// The projection of a task returned by `getExistingTasks`.
#[derive(Serialize, Debug, PartialEq)]
struct TaskSummary {
    title: String,
    status: TaskStatus,
    time: Option<String>,
}

// --- Dispatcher ---

/// Executes remote tool calls against an externally owned [`TaskBoard`].
#[derive(Clone)]
pub struct ToolDispatcher {
    board: Arc<dyn TaskBoard>,
}

impl ToolDispatcher {
    pub fn new(board: Arc<dyn TaskBoard>) -> Self {
        Self { board }
    }

    /// Declarations advertised to the remote service at session setup.
    pub fn declarations() -> Vec<ToolDeclaration> {
        vec![
            ToolDeclaration {
                name: ADD_TASK.to_string(),
                description: "Add a task to the user's board. Call this immediately whenever the user mentions something they need to do; do not ask for confirmation.".to_string(),
                parameters: schema_for!(AddTaskArgs).as_value().clone(),
            },
            ToolDeclaration {
                name: MARK_TASK_COMPLETE.to_string(),
                description: "Mark an existing task as completed.".to_string(),
                parameters: schema_for!(MarkTaskCompleteArgs).as_value().clone(),
            },
            ToolDeclaration {
                name: GET_EXISTING_TASKS.to_string(),
                description: "List the tasks currently on the user's board.".to_string(),
                parameters: json!({ "type": "object", "properties": {} }),
            },
        ]
    }

    /// Executes one tool call and builds its correlated response.
    pub fn dispatch(&self, request: &ToolCallRequest) -> ToolCallResponse {
        info!(tool = %request.name, call_id = %request.id, "Executing tool call");
        let result = match request.name.as_str() {
            ADD_TASK => parse_args(&request.args).map(|args| self.add_task(args)),
            MARK_TASK_COMPLETE => parse_args(&request.args).map(|args| self.mark_complete(args)),
            GET_EXISTING_TASKS => Ok(self.existing_tasks()),
            other => {
                warn!(tool = %other, "Unrecognized tool requested; answering permissively");
                Ok(json!({ "status": "ok" }))
            }
        };

        let result = result.unwrap_or_else(|message| {
            warn!(tool = %request.name, call_id = %request.id, %message, "Tool arguments rejected");
            json!({ "status": "error", "message": message })
        });

        ToolCallResponse {
            id: request.id.clone(),
            name: request.name.clone(),
            result,
        }
    }

    /// Executes a batch of tool calls, returning responses in request order.
    pub fn dispatch_batch(&self, requests: &[ToolCallRequest]) -> Vec<ToolCallResponse> {
        requests.iter().map(|r| self.dispatch(r)).collect()
    }

    fn add_task(&self, args: AddTaskArgs) -> Value {
        self.board.add_task(NewTask {
            title: args.title,
            time: args.time,
            description: args.description,
            category: args.category.as_deref().map(TaskCategory::parse_lenient),
            location: None,
        });
        json!({ "status": "success", "message": "Task added to board." })
    }

    fn mark_complete(&self, args: MarkTaskCompleteArgs) -> Value {
        let tasks = self.board.tasks();
        match find_task(&tasks, &args.title) {
            Some(task) => self.board.complete_task(&task.id),
            // An unmatched title still reports success; the assistant has no
            // not-found branch to act on.
            None => info!(query = %args.title, "No task matched; nothing to complete"),
        }
        json!({ "status": "success", "message": "Task marked complete." })
    }

    fn existing_tasks(&self) -> Value {
        let tasks: Vec<TaskSummary> = self
            .board
            .tasks()
            .into_iter()
            .map(|t| TaskSummary {
                title: t.title,
                status: t.status,
                time: t.time,
            })
            .collect();
        json!({ "tasks": tasks })
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: &Map<String, Value>) -> Result<T, String> {
    serde_json::from_value(Value::Object(args.clone())).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{MemoryTaskBoard, MockTaskBoard};
    use crate::task::Task;

    fn request(id: &str, name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            args: args.as_object().cloned().unwrap_or_default(),
        }
    }

    fn existing(id: &str, title: &str) -> Task {
        Task {
            id: id.to_string(),
            ..Task::from_new(NewTask::titled(title))
        }
    }

    #[test]
    fn test_add_task_invokes_board_once() {
        let mut board = MockTaskBoard::new();
        board
            .expect_add_task()
            .withf(|t| t.title == "Buy milk" && t.category.is_none())
            .times(1)
            .return_const(());
        let dispatcher = ToolDispatcher::new(Arc::new(board));

        let response = dispatcher.dispatch(&request("call-1", ADD_TASK, json!({"title": "Buy milk"})));

        assert_eq!(response.id, "call-1");
        assert_eq!(response.name, ADD_TASK);
        assert_eq!(
            response.result,
            json!({"status": "success", "message": "Task added to board."})
        );
    }

    #[test]
    fn test_add_task_passes_optional_fields() {
        let mut board = MockTaskBoard::new();
        board
            .expect_add_task()
            .withf(|t| {
                t.time.as_deref() == Some("9am")
                    && t.description.as_deref() == Some("quarterly numbers")
                    && t.category == Some(TaskCategory::Meeting)
            })
            .times(1)
            .return_const(());
        let dispatcher = ToolDispatcher::new(Arc::new(board));

        dispatcher.dispatch(&request(
            "c",
            ADD_TASK,
            json!({"title": "Review", "time": "9am", "description": "quarterly numbers", "category": "Meeting"}),
        ));
    }

    #[test]
    fn test_add_task_without_title_is_rejected_locally() {
        let mut board = MockTaskBoard::new();
        board.expect_add_task().never();
        let dispatcher = ToolDispatcher::new(Arc::new(board));

        let response = dispatcher.dispatch(&request("c", ADD_TASK, json!({"time": "noon"})));

        assert_eq!(response.result["status"], "error");
        assert!(response.result["message"].as_str().unwrap().contains("title"));
    }

    #[test]
    fn test_mark_complete_matches_substring_case_insensitively() {
        let mut board = MockTaskBoard::new();
        board
            .expect_tasks()
            .times(1)
            .returning(|| vec![existing("t1", "Email Sarah"), existing("t2", "Buy milk")]);
        board
            .expect_complete_task()
            .withf(|id| id == "t2")
            .times(1)
            .return_const(());
        let dispatcher = ToolDispatcher::new(Arc::new(board));

        let response = dispatcher.dispatch(&request("c", MARK_TASK_COMPLETE, json!({"title": "MILK"})));

        assert_eq!(
            response.result,
            json!({"status": "success", "message": "Task marked complete."})
        );
    }

    #[test]
    fn test_mark_complete_without_match_still_reports_success() {
        let mut board = MockTaskBoard::new();
        board
            .expect_tasks()
            .returning(|| vec![existing("t1", "Buy milk")]);
        board.expect_complete_task().never();
        let dispatcher = ToolDispatcher::new(Arc::new(board));

        let response = dispatcher.dispatch(&request("c", MARK_TASK_COMPLETE, json!({"title": "dentist"})));

        assert_eq!(response.result["status"], "success");
    }

    #[test]
    fn test_mark_complete_reads_latest_snapshot() {
        let board = Arc::new(MemoryTaskBoard::new());
        let dispatcher = ToolDispatcher::new(board.clone());

        // Added after the dispatcher was built; must still be visible.
        board.add_task(NewTask::titled("Buy milk"));
        dispatcher.dispatch(&request("c", MARK_TASK_COMPLETE, json!({"title": "milk"})));

        assert_eq!(board.tasks()[0].status, TaskStatus::Completed);
    }

    #[test]
    fn test_get_existing_tasks_returns_projection() {
        let board = Arc::new(MemoryTaskBoard::new());
        board.add_task(NewTask {
            title: "Dentist".to_string(),
            time: Some("Tuesday".to_string()),
            description: Some("cleaning".to_string()),
            ..Default::default()
        });
        board.add_task(NewTask::titled("Buy milk"));
        board.complete_task("milk");
        let dispatcher = ToolDispatcher::new(board);

        let response = dispatcher.dispatch(&request("c", GET_EXISTING_TASKS, json!({})));

        assert_eq!(
            response.result,
            json!({"tasks": [
                {"title": "Dentist", "status": "pending", "time": "Tuesday"},
                {"title": "Buy milk", "status": "completed", "time": null},
            ]})
        );
    }

    #[test]
    fn test_unknown_tool_is_permissive() {
        let board = MockTaskBoard::new();
        let dispatcher = ToolDispatcher::new(Arc::new(board));

        let response = dispatcher.dispatch(&request("c-9", "launchRocket", json!({"now": true})));

        assert_eq!(response.id, "c-9");
        assert_eq!(response.result, json!({"status": "ok"}));
    }

    #[test]
    fn test_batch_preserves_request_order() {
        let dispatcher = ToolDispatcher::new(Arc::new(MemoryTaskBoard::new()));
        let batch = vec![
            request("a", ADD_TASK, json!({"title": "One"})),
            request("b", "unknown", json!({})),
            request("c", GET_EXISTING_TASKS, json!({})),
        ];

        let responses = dispatcher.dispatch_batch(&batch);

        let ids: Vec<_> = responses.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert_eq!(responses[2].result["tasks"][0]["title"], "One");
    }

    #[test]
    fn test_declarations_cover_every_tool() {
        let declarations = ToolDispatcher::declarations();
        let names: Vec<_> = declarations.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, [ADD_TASK, MARK_TASK_COMPLETE, GET_EXISTING_TASKS]);

        let add = &declarations[0].parameters;
        assert_eq!(add["required"], json!(["title"]));
        assert!(add["properties"]["category"].is_object());
    }
}

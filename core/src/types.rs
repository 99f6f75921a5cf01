use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// Queue used when a producer or worker does not name one.
pub const DEFAULT_QUEUE: &str = "DEFAULT";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failure,
    Invalid,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Invalid => "INVALID",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILURE" => Ok(TaskStatus::Failure),
            "INVALID" => Ok(TaskStatus::Invalid),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PeonStatus {
    Idle,
    Preparing,
    Working,
    Offline,
}

impl PeonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeonStatus::Idle => "IDLE",
            PeonStatus::Preparing => "PREPARING",
            PeonStatus::Working => "WORKING",
            PeonStatus::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for PeonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status '{0}'")]
pub struct UnknownStatus(pub String);

/// Call arguments stored with a task.
///
/// The main handler, the prerun hook and the postrun hook each get their own
/// positional/keyword pair. Missing fields default to empty; unknown fields are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPayload {
    pub task_args: Vec<JsonValue>,
    pub task_kwargs: Map<String, JsonValue>,
    pub prerun_handler_args: Vec<JsonValue>,
    pub prerun_handler_kwargs: Map<String, JsonValue>,
    pub postrun_handler_args: Vec<JsonValue>,
    pub postrun_handler_kwargs: Map<String, JsonValue>,
}

impl TaskPayload {
    pub fn with_args(task_args: Vec<JsonValue>) -> Self {
        Self {
            task_args,
            ..Default::default()
        }
    }
}

/// A `bountyboard` row exactly as stored. Nothing about the payload is checked.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskRecord {
    pub id: String,
    pub task_name: String,
    pub queue: String,
    pub status: TaskStatus,
    pub payload: JsonValue,
    pub result: Option<JsonValue>,
    pub retry_on_failure: bool,
    pub retry_count: i32,
    pub retry_limit: i32,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A validated task, ready to hand to the execution pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: String,
    pub task_name: String,
    pub queue: String,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub result: Option<JsonValue>,
    pub retry_on_failure: bool,
    pub retry_count: i32,
    pub retry_limit: i32,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskValidationError {
    #[error("task name is empty")]
    EmptyTaskName,

    #[error("queue name is empty")]
    EmptyQueue,

    #[error("retry_count must not be negative (got {0})")]
    NegativeRetryCount(i32),

    #[error("retry_limit must not be negative (got {0})")]
    NegativeRetryLimit(i32),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl TryFrom<TaskRecord> for Task {
    type Error = TaskValidationError;

    fn try_from(record: TaskRecord) -> Result<Self, Self::Error> {
        if record.task_name.trim().is_empty() {
            return Err(TaskValidationError::EmptyTaskName);
        }
        if record.queue.trim().is_empty() {
            return Err(TaskValidationError::EmptyQueue);
        }
        if record.retry_count < 0 {
            return Err(TaskValidationError::NegativeRetryCount(record.retry_count));
        }
        if record.retry_limit < 0 {
            return Err(TaskValidationError::NegativeRetryLimit(record.retry_limit));
        }

        let payload: TaskPayload = serde_json::from_value(record.payload)?;

        Ok(Task {
            id: record.id,
            task_name: record.task_name,
            queue: record.queue,
            status: record.status,
            payload,
            result: record.result,
            retry_on_failure: record.retry_on_failure,
            retry_count: record.retry_count,
            retry_limit: record.retry_limit,
            worker_id: record.worker_id,
            created_at: record.created_at,
        })
    }
}

/// Result of running a task's main handler.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Success(JsonValue),
    /// Diagnostic text including the full error chain.
    Failure(String),
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Success(_) => TaskStatus::Success,
            TaskOutcome::Failure(_) => TaskStatus::Failure,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failure(_))
    }

    /// Value persisted to `bountyboard.result`.
    pub fn result_json(&self) -> JsonValue {
        match self {
            TaskOutcome::Success(value) => value.clone(),
            TaskOutcome::Failure(diagnostic) => JsonValue::String(diagnostic.clone()),
        }
    }
}

/// In-process liveness record for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: String,
    pub status: PeonStatus,
    pub current_task: Option<String>,
    pub queues: Vec<String>,
}

impl WorkerState {
    pub fn new(queues: Vec<String>) -> Self {
        let queues = if queues.is_empty() {
            vec![DEFAULT_QUEUE.to_string()]
        } else {
            queues
        };

        Self {
            id: Uuid::new_v4().to_string(),
            status: PeonStatus::Idle,
            current_task: None,
            queues,
        }
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// A `peon` row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PeonRecord {
    pub id: String,
    pub status: PeonStatus,
    pub current_task: Option<String>,
    pub queues: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskParams {
    pub id: Option<String>,
    pub task_name: String,
    pub queue: String,
    pub payload: TaskPayload,
    pub retry_on_failure: bool,
    pub retry_limit: i32,
}

impl CreateTaskParams {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            id: None,
            task_name: task_name.into(),
            queue: DEFAULT_QUEUE.to_string(),
            payload: TaskPayload::default(),
            retry_on_failure: false,
            retry_limit: 0,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn payload(mut self, payload: TaskPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn args(mut self, args: Vec<JsonValue>) -> Self {
        self.payload.task_args = args;
        self
    }

    pub fn kwargs(mut self, kwargs: Map<String, JsonValue>) -> Self {
        self.payload.task_kwargs = kwargs;
        self
    }

    /// Retry failed runs until `retry_count` exceeds `retry_limit`.
    pub fn retry(mut self, retry_limit: i32) -> Self {
        self.retry_on_failure = true;
        self.retry_limit = retry_limit;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskListFilter {
    pub queue: Option<String>,
    pub status: Option<TaskStatus>,
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(payload: JsonValue) -> TaskRecord {
        TaskRecord {
            id: "task-1".to_string(),
            task_name: "sum".to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            status: TaskStatus::Pending,
            payload,
            result: None,
            retry_on_failure: false,
            retry_count: 0,
            retry_limit: 0,
            worker_id: None,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn test_status_round_trips_through_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failure,
            TaskStatus::Invalid,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert_eq!("failure".parse::<TaskStatus>().unwrap(), TaskStatus::Failure);
        assert!("cancelled".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_uppercase() {
        assert_eq!(serde_json::to_value(TaskStatus::Success).unwrap(), json!("SUCCESS"));
        assert_eq!(serde_json::to_value(PeonStatus::Working).unwrap(), json!("WORKING"));
    }

    #[test]
    fn test_payload_fields_default_to_empty() {
        let task = Task::try_from(record(json!({ "task_args": [2, 3] }))).unwrap();
        assert_eq!(task.payload.task_args, vec![json!(2), json!(3)]);
        assert!(task.payload.task_kwargs.is_empty());
        assert!(task.payload.prerun_handler_args.is_empty());
        assert!(task.payload.postrun_handler_kwargs.is_empty());
    }

    #[test]
    fn test_payload_ignores_unknown_fields() {
        let task = Task::try_from(record(json!({ "name": "sum", "task_args": [] }))).unwrap();
        assert_eq!(task.payload, TaskPayload::default());
    }

    #[test]
    fn test_wrong_payload_shape_is_rejected() {
        let err = Task::try_from(record(json!({ "task_args": "not-a-list" }))).unwrap_err();
        assert!(matches!(err, TaskValidationError::Payload(_)));

        let err = Task::try_from(record(json!([1, 2, 3]))).unwrap_err();
        assert!(matches!(err, TaskValidationError::Payload(_)));

        let err = Task::try_from(record(json!({ "task_kwargs": null }))).unwrap_err();
        assert!(matches!(err, TaskValidationError::Payload(_)));
    }

    #[test]
    fn test_blank_names_and_negative_counters_are_rejected() {
        let mut blank = record(json!({}));
        blank.task_name = "  ".to_string();
        assert!(matches!(
            Task::try_from(blank).unwrap_err(),
            TaskValidationError::EmptyTaskName
        ));

        let mut no_queue = record(json!({}));
        no_queue.queue = String::new();
        assert!(matches!(
            Task::try_from(no_queue).unwrap_err(),
            TaskValidationError::EmptyQueue
        ));

        let mut negative = record(json!({}));
        negative.retry_limit = -1;
        assert!(matches!(
            Task::try_from(negative).unwrap_err(),
            TaskValidationError::NegativeRetryLimit(-1)
        ));
    }

    #[test]
    fn test_outcome_maps_to_status_and_result() {
        let ok = TaskOutcome::Success(json!(5));
        assert_eq!(ok.status(), TaskStatus::Success);
        assert_eq!(ok.result_json(), json!(5));

        let failed = TaskOutcome::Failure("boom".to_string());
        assert!(failed.is_failure());
        assert_eq!(failed.status(), TaskStatus::Failure);
        assert_eq!(failed.result_json(), json!("boom"));
    }

    #[test]
    fn test_worker_state_defaults_to_default_queue() {
        let state = WorkerState::default();
        assert_eq!(state.status, PeonStatus::Idle);
        assert_eq!(state.queues, vec![DEFAULT_QUEUE.to_string()]);
        assert!(state.current_task.is_none());

        let other = WorkerState::new(vec!["A".to_string()]);
        assert_ne!(state.id, other.id);
        assert_eq!(other.queues, vec!["A".to_string()]);
    }

    #[test]
    fn test_create_params_builder() {
        let params = CreateTaskParams::new("sum")
            .queue("A")
            .args(vec![json!(2), json!(3)])
            .retry(2);
        assert_eq!(params.queue, "A");
        assert!(params.retry_on_failure);
        assert_eq!(params.retry_limit, 2);
        assert_eq!(params.payload.task_args.len(), 2);
    }
}

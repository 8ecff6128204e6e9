// src/domain/task.rs

//! Celery wire entities: task ids, arguments, the task message and the
//! result body written back by workers.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{CeleryError, Result, ResultMessage};

/// Content type of every task message this crate publishes.
pub const TASK_CONTENT_TYPE: &str = "application/json";

/// Content encoding of every task message this crate publishes.
pub const TASK_CONTENT_ENCODING: &str = "UTF-8";

/// Unique task identifier.
///
/// Generated once per submission and never reused. It is the join key
/// between the published message and the result lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a new id from the current time and random bits (UUIDv7).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Borrow the task id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Arguments of one task call: either positional or keyword, never both.
///
/// Built from a JSON collection with [`TaskArgs::from_value`]:
///
/// - an array, or an object whose keys are exactly `"0"`, `"1"`, … `"n-1"`
///   in that order, is positional;
/// - any other object is taken whole as keyword arguments.
///
/// ```
/// use mom_celery::TaskArgs;
/// use serde_json::json;
///
/// let args = TaskArgs::from_value(json!(["a", "b"])).unwrap();
/// assert_eq!(args.args(), &[json!("a"), json!("b")]);
/// assert!(args.kwargs().is_empty());
///
/// let args = TaskArgs::from_value(json!({"x": 1, "y": 2})).unwrap();
/// assert!(args.args().is_empty());
/// assert_eq!(args.kwargs()["y"], json!(2));
/// ```
///
/// Deserializing a value that fills both `args` and `kwargs` fails: a call
/// carries one kind of arguments or the other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TaskArgsRepr")]
pub struct TaskArgs {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

#[derive(Deserialize)]
struct TaskArgsRepr {
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: Map<String, Value>,
}

impl TryFrom<TaskArgsRepr> for TaskArgs {
    type Error = CeleryError;

    fn try_from(repr: TaskArgsRepr) -> Result<Self> {
        // ---
        if !repr.args.is_empty() && !repr.kwargs.is_empty() {
            return Err(CeleryError::Configuration(
                "task arguments cannot be both positional and keyword".into(),
            ));
        }
        Ok(Self {
            args: repr.args,
            kwargs: repr.kwargs,
        })
    }
}

impl TaskArgs {
    /// No arguments.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn keyword(kwargs: Map<String, Value>) -> Self {
        Self {
            args: Vec::new(),
            kwargs,
        }
    }

    /// Classify a JSON collection as positional or keyword arguments.
    ///
    /// # Errors
    ///
    /// [`CeleryError::Configuration`] when `value` is neither an array nor an
    /// object.
    pub fn from_value(value: Value) -> Result<Self> {
        // ---
        match value {
            Value::Array(items) => Ok(Self::positional(items)),
            Value::Object(map) if has_index_keys(&map) => {
                Ok(Self::positional(map.into_iter().map(|(_, v)| v).collect()))
            }
            Value::Object(map) => Ok(Self::keyword(map)),
            other => Err(CeleryError::Configuration(format!(
                "task arguments must be an array or an object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn is_positional(&self) -> bool {
        self.kwargs.is_empty()
    }
}

// Compact JSON of whichever side is populated, for diagnostics.
impl fmt::Display for TaskArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = if self.is_positional() {
            serde_json::to_string(&self.args)
        } else {
            serde_json::to_string(&self.kwargs)
        };
        match rendered {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("<unprintable>"),
        }
    }
}

/// Keys are exactly "0".."n-1", in insertion order.
fn has_index_keys(map: &Map<String, Value>) -> bool {
    map.keys().enumerate().all(|(i, key)| *key == i.to_string())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// The JSON body of a published task (Celery message protocol v1).
///
/// `{"id": ..., "task": ..., "args": [...], "kwargs": {...}}`
#[derive(Debug, Serialize)]
pub struct TaskMessage<'a> {
    pub id: &'a str,
    pub task: &'a str,
    pub args: &'a [Value],
    pub kwargs: &'a Map<String, Value>,
}

impl<'a> TaskMessage<'a> {
    pub fn new(id: &'a TaskId, task: &'a str, args: &'a TaskArgs) -> Self {
        Self {
            id: id.as_str(),
            task,
            args: args.args(),
            kwargs: args.kwargs(),
        }
    }

    /// Serialize to the UTF-8 JSON wire body.
    pub fn to_body(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Task state as reported by the result backend.
///
/// The vocabulary is fixed and case-sensitive on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for execution, or unknown.
    Pending,
    /// Picked up by a worker.
    Started,
    /// Will be retried.
    Retry,
    /// Raised an exception or exhausted its retries.
    Failure,
    /// Completed; the result holds the return value.
    Success,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Retry => "RETRY",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Success => "SUCCESS",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded result body: `{"status": ..., "result": ..., "traceback": ...}`.
///
/// Extra fields workers add (`task_id`, `children`, `date_done`) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBody {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub traceback: Option<String>,
}

impl ResultBody {
    /// Decode a raw backend record.
    ///
    /// Only JSON bodies are understood; a record without a content type is
    /// assumed to be JSON.
    pub fn decode(message: &ResultMessage) -> Result<Self> {
        // ---
        if let Some(content_type) = message.content_type.as_deref() {
            if !content_type.to_ascii_lowercase().contains("json") {
                return Err(CeleryError::Decode(format!(
                    "unsupported result content type: {content_type}"
                )));
            }
        }

        Ok(serde_json::from_slice(&message.body)?)
    }
}

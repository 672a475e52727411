use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::{ExpectedFailures, TaskError, TaskId};

/// Positional and keyword arguments of one submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Decode positional argument `index`.
    pub fn positional<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskError> {
        let value = self.args.get(index).ok_or_else(|| {
            TaskError::invalid_input(format!("missing positional argument {index}"))
        })?;
        Ok(T::deserialize(value)?)
    }

    /// Decode keyword argument `name`, `None` when absent.
    pub fn keyword<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, TaskError> {
        self.kwargs
            .get(name)
            .map(|value| T::deserialize(value).map_err(TaskError::from))
            .transpose()
    }
}

/// Broker-side options of a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// Hold the message back for this long before it becomes ready.
    pub countdown: Option<Duration>,
}

impl SubmitOptions {
    pub fn countdown(delay: Duration) -> Self {
        Self {
            countdown: Some(delay),
        }
    }
}

/// What a broker carries from the submitter to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: TaskId,
    pub task: String,
    pub args: TaskArgs,
    pub options: SubmitOptions,
}

impl TaskMessage {
    pub fn new(task: impl Into<String>, args: TaskArgs, options: SubmitOptions) -> Self {
        Self {
            id: TaskId::new(),
            task: task.into(),
            args,
            options,
        }
    }
}

/// A named unit of background work.
///
/// `on_success` and `on_failure` are the task's own completion handlers.
/// Instrumentation wrappers record their metrics first and then call these,
/// so overriding them never bypasses the counters.
pub trait TaskBody: Send + Sync {
    fn name(&self) -> &str;

    /// Failure kinds that count as `expected-error` instead of `error`.
    fn throws(&self) -> ExpectedFailures {
        ExpectedFailures::none()
    }

    fn run(&self, args: &TaskArgs) -> impl Future<Output = Result<Value, TaskError>> + Send;

    fn on_success(&self, _retval: &Value, task_id: &TaskId, _args: &TaskArgs) {
        debug!(task_name = self.name(), %task_id, "task succeeded");
    }

    fn on_failure(&self, err: &TaskError, task_id: &TaskId, _args: &TaskArgs) {
        error!(
            task_name = self.name(),
            %task_id,
            kind = %err.kind(),
            error = %err,
            "task failed"
        );
    }
}

//! Error types for the worker.
//!
//! Collaborator-facing errors ([`ChannelError`], [`RuntimeError`],
//! [`QueueError`], [`ConfigError`]) carry their underlying cause. None of them
//! escape [`TaskExecutor::execute_task`](crate::executor::TaskExecutor::execute_task):
//! the executor folds them into a [`TaskError`], which is cloneable and
//! serializable so it can travel on a [`TaskOutcome`](crate::types::TaskOutcome).

use serde::{Deserialize, Serialize};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure on the notification transport (subscribe, unsubscribe, publish).
///
/// Never fatal to a task: a failed subscribe degrades the task to
/// "cancellation unreachable", everything else is logged.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The transport could not be reached.
    #[error("notification transport unavailable: {message}")]
    Unavailable {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<BoxError>,
    },

    /// A subscription is already active for this channel key.
    #[error("channel {channel} already has an active subscription")]
    AlreadySubscribed {
        /// The contested channel key.
        channel: String,
    },
}

impl ChannelError {
    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
            source: None,
        }
    }
}

/// Failure reported by a [`ContainerRuntime`](crate::runtime::ContainerRuntime).
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime itself could not be invoked (daemon down, binary missing).
    #[error("container runtime unreachable: {message}")]
    Unreachable {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<BoxError>,
    },

    /// The requested image could neither be found locally nor pulled.
    #[error("image {image} unavailable: {message}")]
    ImageUnavailable {
        /// The image reference.
        image: String,
        /// Output of the failed pull.
        message: String,
    },

    /// A runtime command ran but reported failure.
    #[error("{operation} failed: {message}")]
    CommandFailed {
        /// The runtime operation (`create`, `wait`, `kill`, ...).
        operation: &'static str,
        /// Output of the failed command.
        message: String,
    },

    /// The runtime answered with something we could not interpret.
    #[error("unexpected runtime output from {operation}: {output}")]
    UnexpectedOutput {
        /// The runtime operation.
        operation: &'static str,
        /// The raw output.
        output: String,
    },
}

impl RuntimeError {
    /// Returns `true` when the runtime could not even be invoked.
    ///
    /// Start failures of this kind are logged at `error` level rather than
    /// `warn`.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// Failure talking to the task queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue backend failed.
    #[error("queue backend error: {message}")]
    Backend {
        /// Human-readable description of the failure.
        message: String,
        /// The underlying error, if available.
        #[source]
        source: Option<BoxError>,
    },

    /// A stored task record could not be decoded.
    #[error("corrupt task record {task_id}: {message}")]
    Corrupt {
        /// The task whose record is unreadable.
        task_id: String,
        /// What was wrong with it.
        message: String,
    },

    /// No task with this id is known to the queue.
    #[error("task not found: {task_id}")]
    NotFound {
        /// The unknown task id.
        task_id: String,
    },
}

/// Invalid or unreadable worker configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path of the file.
        path: String,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`WorkerConfig`](crate::WorkerConfig).
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path of the file.
        path: String,
        /// The TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A field holds a value outside its allowed range.
    #[error("invalid config value for {field}: {message}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why it was rejected.
        message: String,
    },
}

/// Error attached to a [`TaskOutcome`](crate::types::TaskOutcome).
///
/// # Examples
///
/// ```
/// use cancelable_worker::TaskError;
///
/// let err = TaskError::Termination { message: "daemon gone".to_string() };
/// assert_eq!(err.to_string(), "workload termination failed: daemon gone");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    /// The workload could not be started; no race took place.
    #[error("workload failed to start: {message}")]
    Start {
        /// Description of the start failure.
        message: String,
    },

    /// The runtime failed while the workload was being awaited.
    #[error("workload runtime error: {message}")]
    Runtime {
        /// Description of the runtime failure.
        message: String,
    },

    /// The cleanup termination attempt failed.
    #[error("workload termination failed: {message}")]
    Termination {
        /// Description of the termination failure.
        message: String,
    },
}

impl TaskError {
    pub(crate) fn start(err: &RuntimeError) -> Self {
        Self::Start {
            message: err.to_string(),
        }
    }

    pub(crate) fn runtime(err: &RuntimeError) -> Self {
        Self::Runtime {
            message: err.to_string(),
        }
    }
}

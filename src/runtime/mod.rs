//! Container runtime contract.
//!
//! The executor never talks to a container engine directly; it drives a
//! [`ContainerRuntime`]. Two implementations ship with the crate:
//!
//! - [`DockerCli`](docker::DockerCli) -- shells out to the `docker` binary.
//! - [`ScriptedRuntime`](scripted::ScriptedRuntime) -- in-process workloads
//!   with scripted timing and failures, used by the tests.

pub mod docker;
pub mod scripted;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::RuntimeError;
use crate::types::Task;

pub use docker::DockerCli;
pub use scripted::{ScriptedRuntime, ScriptedWorkload};

/// Stream of raw output chunks from a running workload.
pub type OutputStream = BoxStream<'static, Vec<u8>>;

/// Reference to a started workload.
///
/// Owned by the executor for the task's lifetime and released by the cleanup
/// coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkloadHandle {
    id: String,
    task_id: String,
}

impl WorkloadHandle {
    /// Creates a handle for workload `id` running `task_id`.
    pub fn new(id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_id: task_id.into(),
        }
    }

    /// Runtime-specific workload id (the container id for Docker).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The task this workload belongs to.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }
}

/// Operations the worker needs from a container engine.
///
/// Implementations must be reentrant: calls for different tasks may be in
/// flight at the same time and must not interfere.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Starts the workload for `task`, pulling its image if necessary.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::Unreachable`] when the engine cannot be invoked,
    /// [`RuntimeError::ImageUnavailable`] when the image cannot be obtained,
    /// other variants for failed engine commands.
    async fn start(&self, task: &Task) -> Result<WorkloadHandle, RuntimeError>;

    /// Waits for the workload to exit and returns its exit code.
    ///
    /// # Errors
    ///
    /// Any [`RuntimeError`] raised while waiting.
    async fn await_completion(&self, handle: &WorkloadHandle) -> Result<i64, RuntimeError>;

    /// Stops the workload.
    ///
    /// Idempotent: terminating a workload that already exited succeeds.
    ///
    /// # Errors
    ///
    /// Any [`RuntimeError`] other than "already stopped".
    async fn terminate(&self, handle: &WorkloadHandle) -> Result<(), RuntimeError>;

    /// Follows the workload's output. Side channel only; never part of the
    /// outcome.
    ///
    /// # Errors
    ///
    /// Any [`RuntimeError`] raised while attaching.
    async fn stream_output(&self, handle: &WorkloadHandle) -> Result<OutputStream, RuntimeError>;
}

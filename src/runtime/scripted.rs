//! In-process runtime with scripted workloads.
//!
//! [`ScriptedRuntime`] runs no containers. Each task id can be given a
//! [`ScriptedWorkload`] describing how long it runs, how it exits, and which
//! runtime calls fail. Every call is counted per task, which is how the
//! tests check that termination happens exactly once.
//!
//! Durations are measured with `tokio::time`, so tests can run under a
//! paused clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::Notify;

use super::{ContainerRuntime, OutputStream, WorkloadHandle};
use crate::error::RuntimeError;
use crate::types::Task;

#[derive(Debug, Clone)]
enum StartBehavior {
    Succeed,
    Unreachable,
    MissingImage,
}

#[derive(Debug, Clone)]
enum RunBehavior {
    For(Duration),
    Until(Arc<Notify>),
    FailAfter(Duration, String),
}

#[derive(Debug, Clone)]
enum TerminateBehavior {
    Succeed,
    Fail,
    Panic,
}

/// How one scripted task behaves.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use cancelable_worker::runtime::ScriptedWorkload;
///
/// let workload = ScriptedWorkload::runs_for(Duration::from_secs(30))
///     .with_exit_code(3)
///     .failing_termination();
/// # let _ = workload;
/// ```
#[derive(Debug, Clone)]
pub struct ScriptedWorkload {
    start: StartBehavior,
    run: RunBehavior,
    exit_code: i64,
    terminate: TerminateBehavior,
    output: Vec<Vec<u8>>,
}

impl ScriptedWorkload {
    /// Exits with code 0 after `duration`.
    pub fn runs_for(duration: Duration) -> Self {
        Self {
            start: StartBehavior::Succeed,
            run: RunBehavior::For(duration),
            exit_code: 0,
            terminate: TerminateBehavior::Succeed,
            output: Vec::new(),
        }
    }

    /// Exits when `gate` is notified.
    pub fn until(gate: Arc<Notify>) -> Self {
        Self {
            run: RunBehavior::Until(gate),
            ..Self::runs_for(Duration::ZERO)
        }
    }

    /// `await_completion` fails with `message` after `duration`.
    pub fn fails_after(duration: Duration, message: impl Into<String>) -> Self {
        Self {
            run: RunBehavior::FailAfter(duration, message.into()),
            ..Self::runs_for(Duration::ZERO)
        }
    }

    /// Sets the exit code reported on natural completion.
    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    /// `start` fails as if the runtime could not be invoked.
    pub fn unreachable_runtime(mut self) -> Self {
        self.start = StartBehavior::Unreachable;
        self
    }

    /// `start` fails as if the image could not be pulled.
    pub fn missing_image(mut self) -> Self {
        self.start = StartBehavior::MissingImage;
        self
    }

    /// `terminate` returns an error.
    pub fn failing_termination(mut self) -> Self {
        self.terminate = TerminateBehavior::Fail;
        self
    }

    /// `terminate` panics.
    pub fn panicking_termination(mut self) -> Self {
        self.terminate = TerminateBehavior::Panic;
        self
    }

    /// Adds a chunk to the workload's output stream.
    pub fn with_output(mut self, chunk: impl Into<Vec<u8>>) -> Self {
        self.output.push(chunk.into());
        self
    }
}

impl Default for ScriptedWorkload {
    fn default() -> Self {
        Self::runs_for(Duration::ZERO)
    }
}

/// Per-task call counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeCalls {
    /// `start` calls.
    pub start: usize,
    /// `await_completion` calls.
    pub await_completion: usize,
    /// `terminate` calls.
    pub terminate: usize,
    /// `stream_output` calls.
    pub stream_output: usize,
}

/// [`ContainerRuntime`] that plays back [`ScriptedWorkload`]s.
#[derive(Debug)]
pub struct ScriptedRuntime {
    scripts: DashMap<String, ScriptedWorkload>,
    default_workload: ScriptedWorkload,
    calls: DashMap<String, RuntimeCalls>,
    next_id: AtomicU64,
}

impl ScriptedRuntime {
    /// Tasks without a script exit immediately with code 0.
    pub fn new() -> Self {
        Self::with_default(ScriptedWorkload::default())
    }

    /// Tasks without a script behave like `workload`.
    pub fn with_default(workload: ScriptedWorkload) -> Self {
        Self {
            scripts: DashMap::new(),
            default_workload: workload,
            calls: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Scripts the behavior of `task_id`.
    pub fn script(&self, task_id: impl Into<String>, workload: ScriptedWorkload) {
        self.scripts.insert(task_id.into(), workload);
    }

    /// Call counters for `task_id`.
    pub fn calls(&self, task_id: &str) -> RuntimeCalls {
        self.calls.get(task_id).map(|c| *c).unwrap_or_default()
    }

    /// Total `start` calls across all tasks.
    pub fn total_starts(&self) -> usize {
        self.calls.iter().map(|c| c.start).sum()
    }

    fn workload(&self, task_id: &str) -> ScriptedWorkload {
        self.scripts
            .get(task_id)
            .map(|w| w.clone())
            .unwrap_or_else(|| self.default_workload.clone())
    }

    fn record(&self, task_id: &str, update: impl FnOnce(&mut RuntimeCalls)) {
        update(&mut self.calls.entry(task_id.to_string()).or_default());
    }
}

impl Default for ScriptedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn start(&self, task: &Task) -> Result<WorkloadHandle, RuntimeError> {
        self.record(task.id(), |c| c.start += 1);
        match self.workload(task.id()).start {
            StartBehavior::Succeed => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                Ok(WorkloadHandle::new(format!("scripted-{n}"), task.id()))
            }
            StartBehavior::Unreachable => Err(RuntimeError::Unreachable {
                message: "scripted runtime unreachable".to_string(),
                source: None,
            }),
            StartBehavior::MissingImage => Err(RuntimeError::ImageUnavailable {
                image: task.image().to_string(),
                message: "scripted pull failure".to_string(),
            }),
        }
    }

    async fn await_completion(&self, handle: &WorkloadHandle) -> Result<i64, RuntimeError> {
        self.record(handle.task_id(), |c| c.await_completion += 1);
        let workload = self.workload(handle.task_id());
        match workload.run {
            RunBehavior::For(duration) => {
                tokio::time::sleep(duration).await;
                Ok(workload.exit_code)
            }
            RunBehavior::Until(gate) => {
                gate.notified().await;
                Ok(workload.exit_code)
            }
            RunBehavior::FailAfter(duration, message) => {
                tokio::time::sleep(duration).await;
                Err(RuntimeError::CommandFailed {
                    operation: "wait",
                    message,
                })
            }
        }
    }

    async fn terminate(&self, handle: &WorkloadHandle) -> Result<(), RuntimeError> {
        self.record(handle.task_id(), |c| c.terminate += 1);
        match self.workload(handle.task_id()).terminate {
            TerminateBehavior::Succeed => Ok(()),
            TerminateBehavior::Fail => Err(RuntimeError::CommandFailed {
                operation: "kill",
                message: "scripted kill failure".to_string(),
            }),
            TerminateBehavior::Panic => panic!("scripted kill panic"),
        }
    }

    async fn stream_output(&self, handle: &WorkloadHandle) -> Result<OutputStream, RuntimeError> {
        self.record(handle.task_id(), |c| c.stream_output += 1);
        let output = self.workload(handle.task_id()).output;
        Ok(futures::stream::iter(output).boxed())
    }
}

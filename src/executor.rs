//! Per-task execution protocol.
//!
//! [`TaskExecutor::execute_task`] drives one task through a fixed sequence:
//!
//! 1. **start** the workload (a failure ends the task here, nothing to clean)
//!    and arm the [`CleanupCoordinator`];
//! 2. **watch** the task's cancellation channel;
//! 3. **forward** workload output (optional, fire-and-forget);
//! 4. **race** natural completion against the cancellation signal;
//! 5. **clean up** through the [`CleanupCoordinator`];
//! 6. **classify** and return the [`TaskOutcome`].
//!
//! # Tie-break
//!
//! When a cancellation notice is already on its way at the moment the
//! workload exits, cancellation wins. The race is a biased `select!` that
//! polls the signal first, and the completion branch yields to the scheduler
//! once after the workload exits. That single yield gives the router's
//! dispatcher a chance to deliver the pending notice, after which the signal
//! branch is ready on the next poll.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::channel::{self, watch, CancelNotice, CancelSignal, ChannelRouter};
use crate::classify::classify;
use crate::cleanup::CleanupCoordinator;
use crate::error::{RuntimeError, TaskError};
use crate::runtime::{ContainerRuntime, WorkloadHandle};
use crate::types::{RaceBranch, Task, TaskOutcome};

/// Which side of the race resolved first, with what it carried.
#[derive(Debug)]
enum RaceResult {
    Completed(Result<i64, RuntimeError>),
    Cancelled(CancelNotice),
}

impl RaceResult {
    fn branch(&self) -> RaceBranch {
        match self {
            Self::Completed(_) => RaceBranch::Completed,
            Self::Cancelled(_) => RaceBranch::Cancelled,
        }
    }
}

/// Runs tasks against a [`ContainerRuntime`], listening for cancellation on
/// a shared [`ChannelRouter`].
///
/// Cheap to share: wrap in an `Arc` and call [`execute_task`] from as many
/// tokio tasks as needed.
///
/// [`execute_task`]: TaskExecutor::execute_task
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use cancelable_worker::channel::{ChannelRouter, InMemoryTransport};
/// use cancelable_worker::runtime::ScriptedRuntime;
/// use cancelable_worker::{OutcomeStatus, Task, TaskExecutor};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let (transport, inbound) = InMemoryTransport::new();
/// let router = ChannelRouter::spawn(Arc::new(transport), inbound);
/// let executor = TaskExecutor::new(Arc::new(ScriptedRuntime::new()), router);
///
/// let outcome = executor.execute_task(&Task::demo("1")).await;
/// assert_eq!(outcome.status(), OutcomeStatus::Finished);
/// assert_eq!(outcome.exit_code(), Some(0));
/// # });
/// ```
pub struct TaskExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    router: Arc<ChannelRouter>,
    forward_output: bool,
}

impl TaskExecutor {
    /// Creates an executor. Output forwarding is off.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, router: Arc<ChannelRouter>) -> Self {
        Self {
            runtime,
            router,
            forward_output: false,
        }
    }

    /// Copies every workload's output to this process's stdout when enabled.
    pub fn with_output_forwarding(mut self, enabled: bool) -> Self {
        self.forward_output = enabled;
        self
    }

    /// The router this executor watches on.
    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.router
    }

    /// Runs `task` to a terminal outcome.
    ///
    /// Never fails and never panics on collaborator errors: start failures,
    /// runtime errors and termination failures all end up on the returned
    /// [`TaskOutcome`].
    pub async fn execute_task(&self, task: &Task) -> TaskOutcome {
        let span = info_span!("task", task_id = %task.id());
        self.execute(task).instrument(span).await
    }

    /// Asks whichever worker runs `task_id` to cancel it.
    ///
    /// Returns once the notice is published; unknown and finished tasks are a
    /// silent no-op.
    pub async fn request_cancellation(&self, task_id: &str) {
        channel::request_cancellation(&self.router, task_id).await;
    }

    async fn execute(&self, task: &Task) -> TaskOutcome {
        let handle = match self.runtime.start(task).await {
            Ok(handle) => handle,
            Err(e) => {
                if e.is_unreachable() {
                    error!(image = task.image(), error = %e, "container runtime unreachable");
                } else {
                    warn!(image = task.image(), error = %e, "failed to start workload");
                }
                let err = TaskError::start(&e);
                let status = classify(RaceBranch::Completed, Some(&err));
                return TaskOutcome::new(task.id(), status, None, Some(err));
            }
        };
        info!(workload = handle.id(), image = task.image(), "workload started");

        // Armed before the watch opens: dropping this future from here on
        // still tears the workload down.
        let mut cleanup = CleanupCoordinator::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.router),
            handle.clone(),
            None,
        );
        let mut signal = match watch(&self.router, task.id()).await {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "cancellation unreachable for this task");
                CancelSignal::unreachable()
            }
        };
        if let Some(key) = signal.key() {
            cleanup.attach_channel(key.clone());
        }

        if self.forward_output {
            spawn_output_forwarder(Arc::clone(&self.runtime), handle.clone());
        }

        let result = race(self.runtime.as_ref(), &handle, &mut signal).await;
        let branch = result.branch();
        let report = cleanup.run(branch).await;

        let (exit_code, error) = match result {
            RaceResult::Completed(Ok(code)) => {
                debug!(exit_code = code, "workload exited");
                (Some(code), None)
            }
            RaceResult::Completed(Err(e)) => {
                warn!(error = %e, "failed while awaiting workload");
                (None, Some(TaskError::runtime(&e)))
            }
            RaceResult::Cancelled(notice) => {
                info!(payload = %notice.payload, "cancellation received");
                (None, report.termination_error)
            }
        };

        let status = classify(branch, error.as_ref());
        info!(status = %status, "task finished");
        TaskOutcome::new(task.id(), status, exit_code, error)
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("forward_output", &self.forward_output)
            .finish_non_exhaustive()
    }
}

/// Races natural completion against `signal`.
///
/// The losing future is dropped where it stands.
async fn race(
    runtime: &dyn ContainerRuntime,
    handle: &WorkloadHandle,
    signal: &mut CancelSignal,
) -> RaceResult {
    let completion = async {
        let exited = runtime.await_completion(handle).await;
        tokio::task::yield_now().await;
        exited
    };

    tokio::select! {
        biased;
        notice = signal.cancelled() => RaceResult::Cancelled(notice),
        exited = completion => RaceResult::Completed(exited),
    }
}

fn spawn_output_forwarder(runtime: Arc<dyn ContainerRuntime>, handle: WorkloadHandle) {
    tokio::spawn(
        async move {
            let mut output = match runtime.stream_output(&handle).await {
                Ok(output) => output,
                Err(e) => {
                    debug!(error = %e, "output not available");
                    return;
                }
            };
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = output.next().await {
                if stdout.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            if let Err(e) = stdout.flush().await {
                debug!(error = %e, "failed to flush forwarded output");
            }
        }
        .in_current_span(),
    );
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::{channel_key, InMemoryTransport};
    use crate::runtime::{ScriptedRuntime, ScriptedWorkload};
    use crate::types::OutcomeStatus;

    fn executor(runtime: Arc<ScriptedRuntime>) -> (TaskExecutor, Arc<InMemoryTransport>) {
        let (transport, inbound) = InMemoryTransport::new();
        let transport = Arc::new(transport);
        let router = ChannelRouter::spawn(transport.clone(), inbound);
        (TaskExecutor::new(runtime, router), transport)
    }

    #[tokio::test(start_paused = true)]
    async fn natural_completion_reports_exit_code() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.script("1", ScriptedWorkload::runs_for(Duration::from_secs(30)).with_exit_code(2));
        let (executor, _) = executor(runtime.clone());

        let outcome = executor.execute_task(&Task::demo("1")).await;
        assert_eq!(outcome.status(), OutcomeStatus::Finished);
        assert_eq!(outcome.exit_code(), Some(2));
        assert_eq!(runtime.calls("1").terminate, 1);
    }

    #[tokio::test]
    async fn start_failure_skips_watch_and_cleanup() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.script("1", ScriptedWorkload::default().missing_image());
        let (executor, transport) = executor(runtime.clone());

        let outcome = executor.execute_task(&Task::demo("1")).await;
        assert_eq!(outcome.status(), OutcomeStatus::FinishedWithError);
        assert!(matches!(outcome.error(), Some(TaskError::Start { .. })));
        assert_eq!(runtime.calls("1").terminate, 0);
        assert_eq!(transport.subscribe_count(&channel_key("1")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_error_while_waiting() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.script("1", ScriptedWorkload::fails_after(Duration::from_secs(5), "daemon restarted"));
        let (executor, _) = executor(runtime.clone());

        let outcome = executor.execute_task(&Task::demo("1")).await;
        assert_eq!(outcome.status(), OutcomeStatus::FinishedWithError);
        assert!(matches!(outcome.error(), Some(TaskError::Runtime { .. })));
        assert_eq!(runtime.calls("1").terminate, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_failure_degrades_to_unreachable() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.script("1", ScriptedWorkload::runs_for(Duration::from_secs(10)));
        let (executor, transport) = executor(runtime.clone());
        transport.fail_subscribe(true);

        let outcome = executor.execute_task(&Task::demo("1")).await;
        assert_eq!(outcome.status(), OutcomeStatus::Finished);
        assert_eq!(transport.unsubscribe_count(&channel_key("1")), 0);
        assert_eq!(runtime.calls("1").terminate, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn termination_failure_on_completion_keeps_finished() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.script(
            "1",
            ScriptedWorkload::runs_for(Duration::from_secs(1)).failing_termination(),
        );
        let (executor, _) = executor(runtime.clone());

        let outcome = executor.execute_task(&Task::demo("1")).await;
        assert_eq!(outcome.status(), OutcomeStatus::Finished);
        assert_eq!(outcome.error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn forwarded_output_is_requested() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.script(
            "1",
            ScriptedWorkload::runs_for(Duration::from_secs(1)).with_output(b"[JobID=1] 1/30\n".to_vec()),
        );
        let (executor, _) = executor(runtime.clone());
        let executor = executor.with_output_forwarding(true);

        executor.execute_task(&Task::demo("1")).await;
        assert_eq!(runtime.calls("1").stream_output, 1);
    }
}

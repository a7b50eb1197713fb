//! Exactly-once teardown of a task's workload and cancellation subscription.
//!
//! A [`CleanupCoordinator`] is created as soon as a workload has started and
//! owns the two resources that must be released: the [`WorkloadHandle`] and
//! the watch's [`ChannelKey`]. Teardown always runs the same two steps, in
//! order:
//!
//! 1. terminate the workload (already-exited workloads are fine);
//! 2. unsubscribe the cancellation channel.
//!
//! Neither step depends on the other succeeding. A panic inside the runtime's
//! `terminate` is caught and reported as a termination failure.
//!
//! Exactly-once is a property of ownership: [`CleanupCoordinator::run`]
//! consumes the coordinator, and a coordinator dropped without running (the
//! task future itself was dropped) schedules its teardown from `Drop`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelKey, ChannelRouter};
use crate::error::TaskError;
use crate::runtime::{ContainerRuntime, WorkloadHandle};
use crate::types::RaceBranch;

/// What teardown observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Set when the termination attempt failed or panicked.
    pub termination_error: Option<TaskError>,
    /// `true` when a subscription was released.
    pub unsubscribed: bool,
}

#[derive(Debug)]
struct Resources {
    handle: WorkloadHandle,
    channel: Option<ChannelKey>,
}

/// Owns a started task's resources until they are released.
pub struct CleanupCoordinator {
    runtime: Arc<dyn ContainerRuntime>,
    router: Arc<ChannelRouter>,
    resources: Option<Resources>,
}

impl CleanupCoordinator {
    /// Takes ownership of `handle` and, if the watch was opened, `channel`.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        router: Arc<ChannelRouter>,
        handle: WorkloadHandle,
        channel: Option<ChannelKey>,
    ) -> Self {
        Self {
            runtime,
            router,
            resources: Some(Resources { handle, channel }),
        }
    }

    /// Records the watch's channel so teardown also unsubscribes it.
    pub fn attach_channel(&mut self, channel: ChannelKey) {
        if let Some(resources) = self.resources.as_mut() {
            resources.channel = Some(channel);
        }
    }

    /// The workload this coordinator will terminate.
    pub fn handle(&self) -> Option<&WorkloadHandle> {
        self.resources.as_ref().map(|r| &r.handle)
    }

    /// Runs teardown and waits for it.
    ///
    /// Teardown is spawned onto the runtime, so dropping the returned future
    /// part-way does not cut the sequence short.
    pub async fn run(mut self, branch: RaceBranch) -> CleanupReport {
        let Some(resources) = self.resources.take() else {
            return CleanupReport::default();
        };
        let teardown = tokio::spawn(teardown(
            Arc::clone(&self.runtime),
            Arc::clone(&self.router),
            resources,
            branch,
        ));
        match teardown.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "cleanup task did not complete");
                CleanupReport {
                    termination_error: Some(TaskError::Termination {
                        message: format!("cleanup aborted: {e}"),
                    }),
                    unsubscribed: false,
                }
            }
        }
    }
}

impl std::fmt::Debug for CleanupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupCoordinator")
            .field("resources", &self.resources)
            .finish_non_exhaustive()
    }
}

impl Drop for CleanupCoordinator {
    fn drop(&mut self) {
        let Some(resources) = self.resources.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                warn!(workload = resources.handle.id(), "task dropped before cleanup; scheduling teardown");
                rt.spawn(teardown(
                    Arc::clone(&self.runtime),
                    Arc::clone(&self.router),
                    resources,
                    RaceBranch::Cancelled,
                ));
            }
            Err(_) => {
                error!(
                    workload = resources.handle.id(),
                    "task dropped outside a tokio runtime; workload left running"
                );
            }
        }
    }
}

async fn teardown(
    runtime: Arc<dyn ContainerRuntime>,
    router: Arc<ChannelRouter>,
    resources: Resources,
    branch: RaceBranch,
) -> CleanupReport {
    let Resources { handle, channel } = resources;

    match branch {
        RaceBranch::Cancelled => info!(workload = handle.id(), "terminating cancelled workload"),
        RaceBranch::Completed => debug!(workload = handle.id(), "terminating finished workload"),
    }

    let terminated = AssertUnwindSafe(runtime.terminate(&handle))
        .catch_unwind()
        .await;
    let termination_error = match terminated {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            warn!(workload = handle.id(), error = %e, "failed to terminate workload");
            Some(TaskError::Termination {
                message: e.to_string(),
            })
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(workload = handle.id(), panic = %message, "terminate panicked");
            Some(TaskError::Termination {
                message: format!("terminate panicked: {message}"),
            })
        }
    };

    let unsubscribed = match channel {
        Some(key) => {
            router.unsubscribe(&key).await;
            true
        }
        None => false,
    };

    CleanupReport {
        termination_error,
        unsubscribed,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{channel_key, watch, InMemoryTransport};
    use crate::runtime::{ScriptedRuntime, ScriptedWorkload};
    use crate::types::Task;

    struct Fixture {
        runtime: Arc<ScriptedRuntime>,
        transport: Arc<InMemoryTransport>,
        router: Arc<ChannelRouter>,
    }

    fn fixture() -> Fixture {
        let (transport, inbound) = InMemoryTransport::new();
        let transport = Arc::new(transport);
        let router = ChannelRouter::spawn(transport.clone(), inbound);
        Fixture {
            runtime: Arc::new(ScriptedRuntime::new()),
            transport,
            router,
        }
    }

    async fn coordinator(fx: &Fixture, task_id: &str) -> CleanupCoordinator {
        let handle = fx.runtime.start(&Task::demo(task_id)).await.unwrap();
        let signal = watch(&fx.router, task_id).await.unwrap();
        CleanupCoordinator::new(
            fx.runtime.clone(),
            fx.router.clone(),
            handle,
            signal.key().cloned(),
        )
    }

    #[tokio::test]
    async fn run_terminates_then_unsubscribes() {
        let fx = fixture();
        let report = coordinator(&fx, "c1").await.run(RaceBranch::Completed).await;

        assert_eq!(report, CleanupReport { termination_error: None, unsubscribed: true });
        assert_eq!(fx.runtime.calls("c1").terminate, 1);
        assert_eq!(fx.transport.unsubscribe_count(&channel_key("c1")), 1);
        assert!(!fx.router.is_subscribed(&channel_key("c1")));
    }

    #[tokio::test]
    async fn termination_failure_still_unsubscribes() {
        let fx = fixture();
        fx.runtime.script("c2", ScriptedWorkload::default().failing_termination());
        let report = coordinator(&fx, "c2").await.run(RaceBranch::Cancelled).await;

        assert!(matches!(report.termination_error, Some(TaskError::Termination { .. })));
        assert!(report.unsubscribed);
        assert_eq!(fx.transport.unsubscribe_count(&channel_key("c2")), 1);
    }

    #[tokio::test]
    async fn terminate_panic_is_reported() {
        let fx = fixture();
        fx.runtime.script("c3", ScriptedWorkload::default().panicking_termination());
        let report = coordinator(&fx, "c3").await.run(RaceBranch::Cancelled).await;

        let Some(TaskError::Termination { message }) = report.termination_error else {
            panic!("expected termination error");
        };
        assert!(message.contains("scripted kill panic"));
        assert!(report.unsubscribed);
    }

    #[tokio::test]
    async fn unsubscribe_failure_does_not_surface() {
        let fx = fixture();
        let cleanup = coordinator(&fx, "c4").await;
        fx.transport.fail_unsubscribe(true);
        let report = cleanup.run(RaceBranch::Completed).await;

        assert_eq!(report.termination_error, None);
        assert_eq!(fx.runtime.calls("c4").terminate, 1);
    }

    #[tokio::test]
    async fn missing_channel_skips_unsubscribe() {
        let fx = fixture();
        let handle = fx.runtime.start(&Task::demo("c5")).await.unwrap();
        let cleanup = CleanupCoordinator::new(fx.runtime.clone(), fx.router.clone(), handle, None);
        let report = cleanup.run(RaceBranch::Completed).await;

        assert!(!report.unsubscribed);
        assert_eq!(fx.runtime.calls("c5").terminate, 1);
        assert_eq!(fx.transport.unsubscribe_count(&channel_key("c5")), 0);
    }

    #[tokio::test]
    async fn dropped_coordinator_tears_down_once() {
        let fx = fixture();
        let cleanup = coordinator(&fx, "c6").await;
        drop(cleanup);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fx.runtime.calls("c6").terminate, 1);
        assert_eq!(fx.transport.unsubscribe_count(&channel_key("c6")), 1);
    }
}

//! Queue → worker → executor → acknowledge, with an operator stopping one
//! task part-way.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use cancelable_worker::queue::{InMemoryQueue, QueueState, TaskQueue, TaskRequest};
use cancelable_worker::runtime::ScriptedWorkload;
use cancelable_worker::{OutcomeStatus, TaskError, Worker};

use common::Harness;

async fn settle(queue: &InMemoryQueue, count: usize) {
    loop {
        let tasks = queue.list().await.unwrap();
        if tasks.len() == count && tasks.iter().all(|t| t.state.is_terminal()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn operator_stops_one_of_several_running_tasks() {
    let h = Harness::with_default(ScriptedWorkload::runs_for(Duration::from_secs(30)));
    h.script(
        "3",
        ScriptedWorkload::runs_for(Duration::from_secs(30)).failing_termination(),
    );
    let queue = Arc::new(InMemoryQueue::new());
    for _ in 0..3 {
        queue.enqueue(TaskRequest::demo()).await.unwrap();
    }

    let worker = Worker::new(queue.clone(), h.executor.clone())
        .with_concurrency(3)
        .with_poll_interval(Duration::from_millis(100));
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(queue.state("2").await.unwrap(), QueueState::Active);
    h.executor.request_cancellation("2").await;
    h.executor.request_cancellation("3").await;

    settle(&queue, 3).await;
    shutdown.cancel();
    assert_eq!(running.await.unwrap(), 3);

    let tasks = queue.list().await.unwrap();
    let summary: Vec<_> = tasks
        .iter()
        .map(|t| (t.task.id().to_string(), t.state, t.outcome.as_ref().map(|o| o.status())))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("1".to_string(), QueueState::Completed, Some(OutcomeStatus::Finished)),
            ("2".to_string(), QueueState::Cancelled, Some(OutcomeStatus::Cancelled)),
            ("3".to_string(), QueueState::Cancelled, Some(OutcomeStatus::CancelledWithError)),
        ]
    );
    let err = tasks[2].outcome.as_ref().and_then(|o| o.error().cloned());
    assert!(matches!(err, Some(TaskError::Termination { .. })));
    assert_eq!(h.router.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn acknowledged_outcome_serializes_for_the_queue() {
    let h = Harness::with_default(ScriptedWorkload::runs_for(Duration::from_secs(1)).with_exit_code(7));
    let queue = Arc::new(InMemoryQueue::new());
    queue.enqueue(TaskRequest::demo()).await.unwrap();

    let worker = Worker::new(queue.clone(), h.executor.clone())
        .with_poll_interval(Duration::from_millis(100));
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });
    settle(&queue, 1).await;
    shutdown.cancel();
    running.await.unwrap();

    let entry = queue.list().await.unwrap().remove(0);
    let json = serde_json::to_value(&entry).unwrap();
    assert_eq!(json["state"], "completed");
    assert_eq!(json["outcome"]["status"], "FINISHED");
    assert_eq!(json["outcome"]["exitCode"], 7);
    assert_eq!(json["outcome"]["taskId"], "1");
}

//! Channel, queue and workload defaults.

/// Prefix of every cancellation channel key: `cancel:{task_id}`.
pub const CANCEL_CHANNEL_PREFIX: &str = "cancel";

/// Payload published by operators to request a cancellation.
pub const CANCEL_PAYLOAD: &str = "abort";

/// Queue name used when none is configured.
pub const DEFAULT_QUEUE_NAME: &str = "dockerQueue";

/// Maximum number of tasks a single worker runs at once.
pub const DEFAULT_CONCURRENCY: usize = 50;

/// Image used by the demo workload.
pub const DEFAULT_IMAGE: &str = "alpine:3.14";

/// How long the demo workload runs, in seconds.
pub const DEMO_RUNTIME_SECS: u32 = 30;

/// Idle delay between queue polls, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Label attached to every container started for a task.
pub const TASK_LABEL: &str = "cancelable-worker.task-id";

//! Queue worker for long-running, container-backed tasks with per-task
//! cancellation.
//!
//! Each task runs as a container workload. While it runs, the worker keeps a
//! cancellation watch open on a pub/sub channel derived from the task id, so
//! an operator can stop that one task by publishing to the channel. The
//! worker resolves the race between "the workload exited" and "the task was
//! told to stop", classifies the result into a [`TaskOutcome`], and tears the
//! workload and subscription down exactly once.
//!
//! # Module Organization
//!
//! - [`channel`] - Notification channel router, cancellation watch, transports
//! - [`runtime`] - Container runtime contract and the `docker` CLI adapter
//! - [`executor`] - The per-task protocol (start, watch, race, cleanup, report)
//! - [`classify`] - Pure mapping from race result to [`OutcomeStatus`]
//! - [`cleanup`] - Exactly-once teardown of workload and subscription
//! - [`queue`] - Task queue contract with in-memory and Redis implementations
//! - [`worker`] - Bounded-concurrency worker loop feeding the executor
//! - [`config`] - Worker configuration (TOML file + CLI/env overrides)
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use cancelable_worker::channel::{ChannelRouter, InMemoryTransport};
//! use cancelable_worker::channel_key;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let (transport, inbound) = InMemoryTransport::new();
//! let router = ChannelRouter::spawn(Arc::new(transport), inbound);
//!
//! // No task is running under "42", so this is a silent no-op.
//! cancelable_worker::request_cancellation(&router, "42").await;
//! assert_eq!(channel_key("42").as_str(), "cancel:42");
//! # });
//! ```

pub mod channel;
pub mod classify;
pub mod cleanup;
pub mod config;
pub mod constants;
pub mod error;
pub mod executor;
#[cfg(feature = "logging")]
pub mod logging;
pub mod queue;
pub mod runtime;
pub mod types;
pub mod worker;

pub use channel::{channel_key, request_cancellation, ChannelRouter, PubSubTransport};
pub use classify::classify;
pub use config::WorkerConfig;
pub use error::{ChannelError, ConfigError, QueueError, RuntimeError, TaskError};
pub use executor::TaskExecutor;
pub use queue::TaskQueue;
pub use runtime::{ContainerRuntime, WorkloadHandle};
pub use types::*;
pub use worker::Worker;

//! Cancellation notification channels.
//!
//! # Architecture
//!
//! 1. **[`PubSubTransport`]** -- the raw publish/subscribe connection
//!    (Redis in production, [`InMemoryTransport`] in tests). Inbound
//!    messages are handed to the router as an [`Inbound`] stream.
//! 2. **[`ChannelRouter`]** -- owns the transport and a table mapping each
//!    [`ChannelKey`] to the single task waiting on it. Every inbound notice
//!    is dispatched to at most one waiter.
//! 3. **[`CancelSignal`]** -- what a task actually awaits; obtained through
//!    [`watch`].
//!
//! Keys are derived with [`channel_key`]: `cancel:{task_id}`.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod router;
pub mod watch;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{CANCEL_CHANNEL_PREFIX, CANCEL_PAYLOAD};
use crate::error::ChannelError;

pub use memory::InMemoryTransport;
#[cfg(feature = "redis")]
pub use self::redis::RedisTransport;
pub use router::{ChannelRouter, Subscription};
pub use watch::{watch, CancelSignal};

/// Pub/sub channel name a task listens on for cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(String);

impl ChannelKey {
    /// Wraps a raw channel name as received from a transport.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the cancellation channel for a task.
///
/// Injective: distinct task ids always yield distinct keys.
///
/// ```
/// use cancelable_worker::channel_key;
///
/// assert_eq!(channel_key("12").as_str(), "cancel:12");
/// assert_ne!(channel_key("1"), channel_key("12"));
/// ```
pub fn channel_key(task_id: &str) -> ChannelKey {
    ChannelKey(format!("{CANCEL_CHANNEL_PREFIX}:{task_id}"))
}

/// A message received on a cancellation channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelNotice {
    /// Channel the notice arrived on.
    pub channel: ChannelKey,
    /// Raw payload (operators send `"abort"`).
    pub payload: String,
}

impl CancelNotice {
    /// Creates a notice.
    pub fn new(channel: ChannelKey, payload: impl Into<String>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }
}

/// Stream of inbound notices produced by a transport connection.
pub type Inbound = BoxStream<'static, CancelNotice>;

/// Raw publish/subscribe connection.
///
/// Implementations only move messages; routing, de-duplication and the
/// one-subscriber-per-key rule live in [`ChannelRouter`]. Inbound messages
/// for subscribed channels must be yielded on the [`Inbound`] stream created
/// alongside the transport.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Starts delivering messages published on `channel`.
    async fn subscribe(&self, channel: &ChannelKey) -> Result<(), ChannelError>;

    /// Stops delivering messages published on `channel`.
    async fn unsubscribe(&self, channel: &ChannelKey) -> Result<(), ChannelError>;

    /// Broadcasts `payload` on `channel`, returning how many subscribers
    /// received it. Zero subscribers is not an error.
    async fn publish(&self, channel: &ChannelKey, payload: &str) -> Result<usize, ChannelError>;
}

/// Asks whichever worker runs `task_id` to cancel it.
///
/// Returns immediately. If no worker is running the task the notice is
/// dropped; transport failures are logged, never returned.
pub async fn request_cancellation(router: &ChannelRouter, task_id: &str) {
    let key = channel_key(task_id);
    match router.publish(&key, CANCEL_PAYLOAD).await {
        Ok(0) => debug!(task_id, channel = %key, "cancellation published with no subscriber"),
        Ok(receivers) => debug!(task_id, channel = %key, receivers, "cancellation published"),
        Err(e) => warn!(task_id, channel = %key, error = %e, "failed to publish cancellation"),
    }
}

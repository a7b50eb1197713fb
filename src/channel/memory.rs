//! In-process pub/sub transport.
//!
//! [`InMemoryTransport`] behaves like Redis pub/sub inside one process: a
//! publish reaches the inbound stream only while its channel is subscribed.
//! It also counts every call per channel and can be told to fail, which is
//! what the executor tests use to check exactly-once unsubscription and the
//! degraded paths.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{CancelNotice, ChannelKey, Inbound, PubSubTransport};
use crate::error::ChannelError;

#[derive(Debug, Default, Clone, Copy)]
struct CallCounts {
    subscribe: usize,
    unsubscribe: usize,
    publish: usize,
}

/// Thread-safe in-memory [`PubSubTransport`].
///
/// # Examples
///
/// ```
/// use cancelable_worker::channel::{channel_key, InMemoryTransport, PubSubTransport};
///
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let (transport, _inbound) = InMemoryTransport::new();
/// let key = channel_key("1");
///
/// // Nobody listens yet: the publish is dropped.
/// assert_eq!(transport.publish(&key, "abort").await.unwrap(), 0);
///
/// transport.subscribe(&key).await.unwrap();
/// assert_eq!(transport.publish(&key, "abort").await.unwrap(), 1);
/// assert_eq!(transport.subscribe_count(&key), 1);
/// # });
/// ```
#[derive(Debug)]
pub struct InMemoryTransport {
    subscribed: Mutex<HashSet<ChannelKey>>,
    outbound: mpsc::UnboundedSender<CancelNotice>,
    calls: DashMap<ChannelKey, CallCounts>,
    fail_subscribe: AtomicBool,
    fail_unsubscribe: AtomicBool,
    fail_publish: AtomicBool,
    subscribe_delay: Mutex<Duration>,
}

impl InMemoryTransport {
    /// Creates a transport and the inbound stream its deliveries appear on.
    pub fn new() -> (Self, Inbound) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let inbound = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|notice| (notice, receiver))
        })
        .boxed();

        let transport = Self {
            subscribed: Mutex::new(HashSet::new()),
            outbound,
            calls: DashMap::new(),
            fail_subscribe: AtomicBool::new(false),
            fail_unsubscribe: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            subscribe_delay: Mutex::new(Duration::ZERO),
        };
        (transport, inbound)
    }

    /// Makes subsequent `subscribe` calls fail (or succeed again).
    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent `unsubscribe` calls fail (or succeed again).
    pub fn fail_unsubscribe(&self, fail: bool) {
        self.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent `publish` calls fail (or succeed again).
    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent `subscribe` calls take `delay` before answering.
    pub fn delay_subscribe(&self, delay: Duration) {
        *self.subscribe_delay.lock() = delay;
    }

    /// Number of `subscribe` calls seen for `channel`, failed ones included.
    pub fn subscribe_count(&self, channel: &ChannelKey) -> usize {
        self.counts(channel).subscribe
    }

    /// Number of `unsubscribe` calls seen for `channel`, failed ones included.
    pub fn unsubscribe_count(&self, channel: &ChannelKey) -> usize {
        self.counts(channel).unsubscribe
    }

    /// Number of `publish` calls seen for `channel`, failed ones included.
    pub fn publish_count(&self, channel: &ChannelKey) -> usize {
        self.counts(channel).publish
    }

    /// Total `subscribe` calls across all channels.
    pub fn total_subscribes(&self) -> usize {
        self.calls.iter().map(|entry| entry.subscribe).sum()
    }

    /// Returns `true` if `channel` is currently subscribed at transport level.
    pub fn is_subscribed(&self, channel: &ChannelKey) -> bool {
        self.subscribed.lock().contains(channel)
    }

    fn counts(&self, channel: &ChannelKey) -> CallCounts {
        self.calls
            .get(channel)
            .map(|entry| *entry)
            .unwrap_or_default()
    }

    fn record(&self, channel: &ChannelKey, update: impl FnOnce(&mut CallCounts)) {
        update(&mut self.calls.entry(channel.clone()).or_default());
    }
}

#[async_trait]
impl PubSubTransport for InMemoryTransport {
    async fn subscribe(&self, channel: &ChannelKey) -> Result<(), ChannelError> {
        self.record(channel, |c| c.subscribe += 1);
        let delay = *self.subscribe_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ChannelError::unavailable("simulated subscribe failure"));
        }
        self.subscribed.lock().insert(channel.clone());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &ChannelKey) -> Result<(), ChannelError> {
        self.record(channel, |c| c.unsubscribe += 1);
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            return Err(ChannelError::unavailable("simulated unsubscribe failure"));
        }
        self.subscribed.lock().remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &ChannelKey, payload: &str) -> Result<usize, ChannelError> {
        self.record(channel, |c| c.publish += 1);
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(ChannelError::unavailable("simulated publish failure"));
        }
        if !self.subscribed.lock().contains(channel) {
            return Ok(0);
        }
        self.outbound
            .send(CancelNotice::new(channel.clone(), payload))
            .map_err(|_| ChannelError::unavailable("inbound stream closed"))?;
        Ok(1)
    }
}

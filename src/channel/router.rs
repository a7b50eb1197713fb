//! Routes inbound cancellation notices to the one task waiting on each key.
//!
//! # Concurrency
//!
//! The subscription table is a `parking_lot::Mutex<HashMap<..>>`. The lock is
//! only ever taken in synchronous sections (never across an `.await`), so a
//! registration, a removal and a dispatch for the same key can never
//! interleave.
//!
//! A table entry ([`Slot`]) lives from `subscribe` until `unsubscribe` and
//! represents the transport-level subscription. Its sender is taken on the
//! first matching notice, so later notices for the same key find an empty
//! slot and are dropped: each subscription observes at most one cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{CancelNotice, ChannelKey, Inbound, PubSubTransport};
use crate::error::ChannelError;

type SlotTable = Arc<Mutex<HashMap<ChannelKey, Slot>>>;

/// One active subscription.
#[derive(Debug)]
struct Slot {
    /// `None` once a notice has been delivered.
    sender: Option<oneshot::Sender<CancelNotice>>,
}

/// Handle returned by [`ChannelRouter::subscribe`].
///
/// Resolves (once) when a notice for its key is dispatched.
#[derive(Debug)]
pub struct Subscription {
    key: ChannelKey,
    receiver: oneshot::Receiver<CancelNotice>,
}

impl Subscription {
    /// The subscribed channel.
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub(crate) fn into_parts(self) -> (ChannelKey, oneshot::Receiver<CancelNotice>) {
        (self.key, self.receiver)
    }
}

/// Shares one pub/sub connection between every task running in the process.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use cancelable_worker::channel::{channel_key, ChannelRouter, InMemoryTransport};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let (transport, inbound) = InMemoryTransport::new();
/// let router = ChannelRouter::spawn(Arc::new(transport), inbound);
///
/// let key = channel_key("7");
/// let _sub = router.subscribe(key.clone()).await.unwrap();
/// assert!(router.is_subscribed(&key));
///
/// router.unsubscribe(&key).await;
/// router.unsubscribe(&key).await; // idempotent
/// assert!(!router.is_subscribed(&key));
/// # });
/// ```
pub struct ChannelRouter {
    transport: Arc<dyn PubSubTransport>,
    slots: SlotTable,
    dispatcher: JoinHandle<()>,
}

impl ChannelRouter {
    /// Creates a router over `transport` and spawns the dispatch loop that
    /// consumes `inbound`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(transport: Arc<dyn PubSubTransport>, inbound: Inbound) -> Arc<Self> {
        let slots: SlotTable = Arc::new(Mutex::new(HashMap::new()));
        let dispatcher = tokio::spawn(dispatch_loop(inbound, Arc::clone(&slots)));
        Arc::new(Self {
            transport,
            slots,
            dispatcher,
        })
    }

    /// Registers interest in `key`.
    ///
    /// The slot is inserted before the transport subscribe so that a notice
    /// arriving right after the transport acknowledges cannot be missed. On
    /// transport failure, or if this future is dropped before the transport
    /// answers, the slot is removed again.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::AlreadySubscribed`] if `key` is already active.
    /// - [`ChannelError::Unavailable`] if the transport subscribe fails.
    pub async fn subscribe(&self, key: ChannelKey) -> Result<Subscription, ChannelError> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut slots = self.slots.lock();
            if slots.contains_key(&key) {
                return Err(ChannelError::AlreadySubscribed {
                    channel: key.to_string(),
                });
            }
            slots.insert(
                key.clone(),
                Slot {
                    sender: Some(sender),
                },
            );
        }
        let pending = PendingSlot {
            slots: &self.slots,
            key,
            armed: true,
        };

        // Dropping `pending` (error or cancellation) releases the slot.
        self.transport.subscribe(&pending.key).await?;

        let key = pending.commit();
        debug!(channel = %key, "subscribed");
        Ok(Subscription { key, receiver })
    }

    /// Publishes `payload` on `key`, returning the transport's receiver count.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Unavailable`] if the transport publish fails.
    pub async fn publish(&self, key: &ChannelKey, payload: &str) -> Result<usize, ChannelError> {
        self.transport.publish(key, payload).await
    }

    /// Drops the subscription for `key`.
    ///
    /// Idempotent: unknown keys are ignored. Transport failures are logged.
    /// Any task still waiting on the subscription will never be signalled.
    pub async fn unsubscribe(&self, key: &ChannelKey) {
        if self.slots.lock().remove(key).is_none() {
            debug!(channel = %key, "unsubscribe for inactive channel ignored");
            return;
        }

        match self.transport.unsubscribe(key).await {
            Ok(()) => debug!(channel = %key, "unsubscribed"),
            Err(e) => warn!(channel = %key, error = %e, "transport unsubscribe failed"),
        }
    }

    /// Returns `true` if `key` has an active subscription.
    pub fn is_subscribed(&self, key: &ChannelKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Number of active subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Drop for ChannelRouter {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// A slot inserted by `subscribe` whose transport subscribe has not
/// completed yet.
///
/// The transport may still hold the channel after a cancelled subscribe;
/// notices on it find no slot and are dropped.
struct PendingSlot<'a> {
    slots: &'a Mutex<HashMap<ChannelKey, Slot>>,
    key: ChannelKey,
    armed: bool,
}

impl PendingSlot<'_> {
    fn commit(mut self) -> ChannelKey {
        self.armed = false;
        self.key.clone()
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(channel = %self.key, "subscribe abandoned; releasing slot");
            self.slots.lock().remove(&self.key);
        }
    }
}

async fn dispatch_loop(mut inbound: Inbound, slots: SlotTable) {
    while let Some(notice) = inbound.next().await {
        dispatch(&slots, notice);
    }
    let stranded = slots.lock().len();
    error!(
        active_subscriptions = stranded,
        "notification stream closed; running tasks can no longer be cancelled"
    );
}

/// Hands `notice` to the waiter on its channel, if any. Returns whether it
/// was delivered.
fn dispatch(slots: &Mutex<HashMap<ChannelKey, Slot>>, notice: CancelNotice) -> bool {
    let sender = slots
        .lock()
        .get_mut(&notice.channel)
        .and_then(|slot| slot.sender.take());

    let Some(sender) = sender else {
        debug!(channel = %notice.channel, "notice without waiter dropped");
        return false;
    };

    let channel = notice.channel.clone();
    if sender.send(notice).is_err() {
        debug!(channel = %channel, "waiter gone before notice delivery");
        return false;
    }
    debug!(channel = %channel, "cancellation notice delivered");
    true
}

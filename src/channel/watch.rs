//! Per-task cancellation watch.
//!
//! A [`CancelSignal`] is a pure notification primitive: it resolves once when
//! the task is told to stop and has no side effects on the workload.
//! Termination is the cleanup coordinator's job.

use tokio::sync::oneshot;

use super::{channel_key, CancelNotice, ChannelKey, ChannelRouter};
use crate::error::ChannelError;

/// Opens a cancellation watch for `task_id` on `channel_key(task_id)`.
///
/// # Errors
///
/// Propagates the router's [`ChannelError`]; callers typically degrade to
/// [`CancelSignal::unreachable`].
pub async fn watch(router: &ChannelRouter, task_id: &str) -> Result<CancelSignal, ChannelError> {
    let subscription = router.subscribe(channel_key(task_id)).await?;
    let (key, receiver) = subscription.into_parts();
    Ok(CancelSignal {
        key: Some(key),
        receiver: Some(receiver),
    })
}

/// Single-resolution "this task was told to stop" signal.
#[derive(Debug)]
pub struct CancelSignal {
    key: Option<ChannelKey>,
    receiver: Option<oneshot::Receiver<CancelNotice>>,
}

impl CancelSignal {
    /// A signal that never resolves, for tasks whose subscribe failed.
    pub fn unreachable() -> Self {
        Self {
            key: None,
            receiver: None,
        }
    }

    /// The channel this signal listens on, `None` when unreachable.
    pub fn key(&self) -> Option<&ChannelKey> {
        self.key.as_ref()
    }

    /// Returns `true` if a subscription backs this signal.
    pub fn is_reachable(&self) -> bool {
        self.key.is_some()
    }

    /// Waits for the cancellation notice.
    ///
    /// Resolves at most once over the signal's lifetime. If the subscription
    /// is dropped without a notice (or the signal already fired) the returned
    /// future stays pending forever.
    pub async fn cancelled(&mut self) -> CancelNotice {
        let Some(receiver) = self.receiver.as_mut() else {
            return std::future::pending().await;
        };
        let received = receiver.await;
        self.receiver = None;
        match received {
            Ok(notice) => notice,
            Err(_) => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::channel::{request_cancellation, InMemoryTransport};

    fn router() -> Arc<ChannelRouter> {
        let (transport, inbound) = InMemoryTransport::new();
        ChannelRouter::spawn(Arc::new(transport), inbound)
    }

    #[tokio::test(start_paused = true)]
    async fn signal_resolves_on_matching_notice() {
        let router = router();
        let mut signal = watch(&router, "w1").await.unwrap();
        assert!(signal.is_reachable());

        request_cancellation(&router, "w1").await;
        let notice = signal.cancelled().await;
        assert_eq!(notice.channel, channel_key("w1"));
        assert_eq!(notice.payload, "abort");
    }

    #[tokio::test(start_paused = true)]
    async fn signal_ignores_other_tasks() {
        let router = router();
        let mut signal = watch(&router, "w1").await.unwrap();

        request_cancellation(&router, "w2").await;
        let fired = tokio::time::timeout(Duration::from_secs(60), signal.cancelled()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn signal_never_resolves_after_unsubscribe() {
        let router = router();
        let mut signal = watch(&router, "w1").await.unwrap();

        router.unsubscribe(&channel_key("w1")).await;
        request_cancellation(&router, "w1").await;
        let fired = tokio::time::timeout(Duration::from_secs(60), signal.cancelled()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn signal_resolves_only_once() {
        let router = router();
        let mut signal = watch(&router, "w1").await.unwrap();

        request_cancellation(&router, "w1").await;
        signal.cancelled().await;
        request_cancellation(&router, "w1").await;
        let again = tokio::time::timeout(Duration::from_secs(60), signal.cancelled()).await;
        assert!(again.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_signal_stays_pending() {
        let mut signal = CancelSignal::unreachable();
        assert!(!signal.is_reachable());
        let fired = tokio::time::timeout(Duration::from_secs(60), signal.cancelled()).await;
        assert!(fired.is_err());
    }
}

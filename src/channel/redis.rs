//! Redis pub/sub transport.
//!
//! [`RedisTransport`] uses one [`redis::Client`] for both directions:
//!
//! | Purpose | Connection |
//! |---------|------------|
//! | `SUBSCRIBE` / `UNSUBSCRIBE` | pub/sub connection, sink half |
//! | inbound messages | pub/sub connection, stream half ([`Inbound`]) |
//! | `PUBLISH` | multiplexed connection |
//!
//! A Redis connection in subscribe mode cannot issue `PUBLISH`, hence the
//! second connection.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cancelable_worker::channel::{ChannelRouter, RedisTransport};
//!
//! # async fn example() {
//! let (transport, inbound) = RedisTransport::connect("redis://127.0.0.1:6379").await.unwrap();
//! let router = ChannelRouter::spawn(Arc::new(transport), inbound);
//! # }
//! ```

use ::redis::aio::{MultiplexedConnection, PubSubSink};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::warn;

use super::{CancelNotice, ChannelKey, Inbound, PubSubTransport};
use crate::error::ChannelError;

/// Redis-backed [`PubSubTransport`].
///
/// Both connection halves are cheap to clone; every call clones its
/// connection so concurrent tasks never contend on a `&mut`.
#[derive(Clone)]
pub struct RedisTransport {
    sink: PubSubSink,
    publisher: MultiplexedConnection,
}

impl RedisTransport {
    /// Connects to Redis at `url` and returns the transport plus its inbound
    /// notice stream.
    ///
    /// The URL format is `redis://[:<password>@]<host>:<port>[/<db>]`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Unavailable`] if the client cannot be created
    /// or either connection cannot be established.
    pub async fn connect(url: &str) -> Result<(Self, Inbound), ChannelError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| map_redis_error(e, "failed to create Redis client"))?;
        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| map_redis_error(e, "failed to open Redis pub/sub connection"))?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error(e, "failed to connect to Redis"))?;

        let (sink, stream) = pubsub.split();
        let inbound = stream
            .map(|msg| {
                let channel = ChannelKey::from_raw(msg.get_channel_name());
                // Any message on the channel cancels; the payload is informational.
                let payload = msg.get_payload::<String>().unwrap_or_else(|e| {
                    warn!(channel = %channel, error = %e, "undecodable pub/sub payload");
                    String::new()
                });
                CancelNotice::new(channel, payload)
            })
            .boxed();

        Ok((Self { sink, publisher }, inbound))
    }
}

fn map_redis_error(err: ::redis::RedisError, context: &str) -> ChannelError {
    ChannelError::Unavailable {
        message: format!("{context}: {err}"),
        source: Some(Box::new(err)),
    }
}

#[async_trait]
impl PubSubTransport for RedisTransport {
    async fn subscribe(&self, channel: &ChannelKey) -> Result<(), ChannelError> {
        let mut sink = self.sink.clone();
        sink.subscribe(channel.as_str())
            .await
            .map_err(|e| map_redis_error(e, "SUBSCRIBE failed"))
    }

    async fn unsubscribe(&self, channel: &ChannelKey) -> Result<(), ChannelError> {
        let mut sink = self.sink.clone();
        sink.unsubscribe(channel.as_str())
            .await
            .map_err(|e| map_redis_error(e, "UNSUBSCRIBE failed"))
    }

    async fn publish(&self, channel: &ChannelKey, payload: &str) -> Result<usize, ChannelError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = ::redis::cmd("PUBLISH")
            .arg(channel.as_str())
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, "PUBLISH failed"))?;
        Ok(usize::try_from(receivers).unwrap_or(0))
    }
}

//! Streaming transport: the connector seam, the immutable per-start transport
//! snapshot, and the shipped long-polling implementation.

pub mod long_poll;
pub mod tls;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use url::Url;

use crate::auth::TokenSource;
use crate::config::ReplayFrom;
use crate::error::Result;

/// Immutable transport configuration, built once per `start`. A start after
/// stop builds a fresh snapshot; nothing here is mutated in flight.
#[derive(Clone)]
pub struct TransportConfig {
    pub endpoint: Url,
    pub api_version: String,
    /// How long the server may hold an idle long-poll.
    pub keep_alive: Duration,
    /// Network guard per request; exceeding it is a transport fault, not an
    /// idle poll.
    pub max_network_delay: Duration,
    /// HTTP client carrying the TLS material for both login and streaming.
    pub http: reqwest::Client,
    pub tokens: Arc<TokenSource>,
}

/// A decoded streaming message as handed to a channel consumer.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub replay_id: i64,
    pub payload: serde_json::Value,
}

/// Consumer callback registered per channel. Runs on the transport's delivery
/// path; implementations queue work and return quickly, awaiting only for
/// backpressure.
pub type MessageConsumer = Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// The connector seam between the listener and whatever speaks the wire
/// protocol. The listener bounds `start` and `subscribe` with its configured
/// timeouts and tears the connector down if either elapses.
#[async_trait]
pub trait StreamingConnector: Send + Sync {
    /// Performs the handshake and starts the delivery loop.
    async fn start(&self) -> Result<()>;

    /// Subscribes a channel at a replay position and registers its consumer.
    async fn subscribe(
        &self,
        channel: &str,
        replay_from: ReplayFrom,
        consumer: MessageConsumer,
    ) -> Result<SubscriptionHandle>;

    /// Removes a channel subscription. Unknown channels are a no-op.
    async fn unsubscribe(&self, channel: &str) -> Result<()>;

    /// Tears the connector down. Idempotent.
    async fn stop(&self);
}

/// Handle to one active channel subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    channel: String,
    replay_from: ReplayFrom,
    connector: Weak<dyn StreamingConnector>,
}

impl SubscriptionHandle {
    pub fn new(
        channel: impl Into<String>,
        replay_from: ReplayFrom,
        connector: Weak<dyn StreamingConnector>,
    ) -> Self {
        Self {
            channel: channel.into(),
            replay_from,
            connector,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn replay_from(&self) -> ReplayFrom {
        self.replay_from
    }

    /// Cancels the subscription. Idempotent; a handle that outlives its
    /// connector does nothing.
    pub async fn cancel(&self) -> Result<()> {
        match self.connector.upgrade() {
            Some(connector) => connector.unsubscribe(&self.channel).await,
            None => Ok(()),
        }
    }
}

/// Wire envelope for one pushed event.
#[derive(Debug, Deserialize)]
pub(crate) struct WireEvent {
    pub channel: String,
    pub data: WireEventData,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireEventData {
    pub event: WireEventMeta,
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireEventMeta {
    pub replay_id: i64,
}

impl WireEvent {
    pub(crate) fn into_inbound(self) -> InboundMessage {
        InboundMessage {
            channel: self.channel,
            replay_id: self.data.event.replay_id,
            payload: self.data.payload,
        }
    }
}

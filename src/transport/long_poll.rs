//! Long-polling streaming connector.
//!
//! One background delivery loop per connector multiplexes every channel
//! subscription: `/handshake` establishes a server-side session, `/subscribe`
//! attaches channels at a replay position, and repeated `/connect` calls hold
//! an open request the server answers within the keep-alive interval. Expired
//! credentials (HTTP 401) trigger a serialized token refresh followed by a
//! fresh handshake and exactly one resubscribe per acknowledged channel at
//! its recorded resume position.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::BearerToken;
use crate::config::ReplayFrom;
use crate::error::{ListenerError, Result};
use crate::transport::{
    MessageConsumer, StreamingConnector, SubscriptionHandle, TransportConfig, WireEvent,
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(15);

/// Server-reported reason prefix for a session it no longer recognizes.
const UNKNOWN_CLIENT_PREFIX: &str = "402";

struct ChannelState {
    consumer: MessageConsumer,
    /// Latest replay id delivered, or the requested sentinel until the first
    /// delivery. Resubscribes after a session renewal resume from here.
    cursor: Arc<AtomicI64>,
    /// Set once the server acknowledged the subscribe. Renewal passes skip
    /// unacknowledged channels; their own subscribe call retries instead.
    acked: AtomicBool,
    /// Set when a session renewal invalidates the server-side subscription,
    /// cleared per successful resubscribe. Polls retry flagged channels.
    needs_resubscribe: AtomicBool,
}

pub struct LongPollConnector {
    config: TransportConfig,
    client_id: RwLock<Option<String>>,
    channels: DashMap<String, ChannelState>,
    running: AtomicBool,
    retired: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    self_weak: Weak<LongPollConnector>,
}

impl LongPollConnector {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            client_id: RwLock::new(None),
            channels: DashMap::new(),
            running: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            shutdown_tx: watch::channel(false).0,
            poll_task: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    async fn post<B, T>(&self, call: &str, body: &B, token: &BearerToken) -> Result<Answer<T>>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        // The server may hold `/connect` open for the keep-alive interval;
        // every other call must answer within the network delay alone.
        let bound = if call == "connect" {
            self.config.keep_alive + self.config.max_network_delay
        } else {
            self.config.max_network_delay
        };
        let response = self
            .config
            .http
            .post(call_url(&self.config.endpoint, call))
            .timeout(bound)
            .bearer_auth(token.value())
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Ok(Answer::Unauthorized);
        }
        if !status.is_success() {
            return Err(ListenerError::Transport(format!(
                "{call} failed with status {status}"
            )));
        }
        let parsed = response.json::<T>().await.map_err(|e| {
            ListenerError::Protocol(format!("undecodable {call} response: {e}"))
        })?;
        Ok(Answer::Ok(parsed))
    }

    async fn handshake(&self, token: &BearerToken) -> Result<String> {
        let answer: Answer<HandshakeResponse> = self
            .post("handshake", &serde_json::json!({}), token)
            .await?;
        match answer {
            Answer::Ok(ack) if ack.successful => ack.client_id.ok_or_else(|| {
                ListenerError::Protocol("handshake response missing client id".to_string())
            }),
            Answer::Ok(ack) => Err(ListenerError::Protocol(format!(
                "handshake rejected: {}",
                ack.error.unwrap_or_default()
            ))),
            Answer::Unauthorized => Err(ListenerError::Authentication(
                "handshake rejected: bearer token not accepted".to_string(),
            )),
        }
    }

    async fn start_inner(&self) -> Result<()> {
        let token = self.config.tokens.current().await?;
        let client_id = match self.handshake(&token).await {
            Err(ListenerError::Authentication(_)) => {
                // The token can expire between negotiation and handshake.
                let fresh = self.config.tokens.refresh(&token).await?;
                self.handshake(&fresh).await?
            }
            other => other?,
        };
        *self.client_id.write().await = Some(client_id.clone());

        let shutdown = self.shutdown_tx.subscribe();
        *self.poll_task.lock().await = Some(tokio::spawn(Self::poll_loop(
            self.self_weak.clone(),
            shutdown,
        )));

        info!(
            endpoint = %self.config.endpoint,
            client_id = %client_id,
            api_version = %self.config.api_version,
            "streaming connector started"
        );
        Ok(())
    }

    /// Delivery loop. Holds only a weak connector reference, upgraded per
    /// iteration: a strong one here would keep a dropped connector (and this
    /// loop) alive forever, since `Drop` can only run once the loop lets go.
    async fn poll_loop(connector: Weak<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let outcome = {
                let Some(this) = connector.upgrade() else {
                    debug!("connector dropped; delivery loop exiting");
                    return;
                };
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!("delivery loop shutting down");
                        return;
                    }
                    outcome = this.poll_once() => outcome,
                }
            };
            match outcome {
                Ok(()) => backoff = INITIAL_BACKOFF,
                Err(err) => {
                    warn!(error = %err, delay = ?backoff, "poll failed; backing off");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let client_id = self
            .client_id
            .read()
            .await
            .clone()
            .ok_or_else(|| ListenerError::Transport("no active session".to_string()))?;
        let token = self.config.tokens.current().await?;

        // Heal subscriptions lost by an earlier renewal before polling; a
        // connect on the renewed session succeeds either way and would mask
        // the missing subscription.
        match self.resubscribe_pending(&client_id, &token).await {
            Ok(()) => {}
            Err(ListenerError::Authentication(_)) => return self.reauthenticate(&token).await,
            Err(err) => return Err(err),
        }

        let request = ConnectRequest {
            client_id: &client_id,
        };
        match self.post::<_, ConnectResponse>("connect", &request, &token).await? {
            Answer::Unauthorized => {
                info!("streaming session unauthorized; refreshing credentials");
                self.reauthenticate(&token).await
            }
            Answer::Ok(response) if response.successful => {
                if !response.events.is_empty() {
                    debug!(count = response.events.len(), "events received");
                }
                self.deliver(response.events).await;
                Ok(())
            }
            Answer::Ok(response) => {
                let reason = response
                    .error
                    .unwrap_or_else(|| "connect rejected".to_string());
                if reason.starts_with(UNKNOWN_CLIENT_PREFIX) {
                    info!(reason = %reason, "streaming session lost; renegotiating");
                    self.renew_session(&token).await
                } else {
                    Err(ListenerError::Protocol(reason))
                }
            }
        }
    }

    /// Refreshes the bearer token, then renews the server-side session.
    async fn reauthenticate(&self, stale: &BearerToken) -> Result<()> {
        let fresh = self.config.tokens.refresh(stale).await?;
        self.renew_session(&fresh).await
    }

    /// Fresh handshake plus one resubscribe per acknowledged channel at its
    /// recorded resume position. Every such channel is flagged before the
    /// first attempt: a resubscribe that fails stays flagged and later polls
    /// retry it, instead of the channel silently starving on a session that
    /// otherwise looks healthy.
    async fn renew_session(&self, token: &BearerToken) -> Result<()> {
        let client_id = self.handshake(token).await?;
        *self.client_id.write().await = Some(client_id.clone());

        for entry in self.channels.iter() {
            if entry.value().acked.load(Ordering::SeqCst) {
                entry.value().needs_resubscribe.store(true, Ordering::SeqCst);
            }
        }
        self.resubscribe_pending(&client_id, token).await
    }

    /// Resubscribes every channel flagged as lacking a server-side
    /// subscription, clearing the flag per acknowledgement. A failure leaves
    /// the remaining flags set for the next attempt.
    async fn resubscribe_pending(&self, client_id: &str, token: &BearerToken) -> Result<()> {
        let pending: Vec<(String, i64)> = self
            .channels
            .iter()
            .filter(|entry| entry.value().needs_resubscribe.load(Ordering::SeqCst))
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().cursor.load(Ordering::SeqCst),
                )
            })
            .collect();

        for (channel, replay_from) in pending {
            let request = SubscribeRequest {
                client_id,
                channel: &channel,
                replay_from,
            };
            match self.post::<_, AckResponse>("subscribe", &request, token).await? {
                Answer::Ok(ack) if ack.successful => {
                    if let Some(state) = self.channels.get(&channel) {
                        state.needs_resubscribe.store(false, Ordering::SeqCst);
                    }
                    debug!(channel = %channel, replay_from, "resubscribed after session renewal");
                }
                Answer::Ok(ack) => {
                    return Err(ListenerError::Protocol(format!(
                        "resubscribe rejected for {channel}: {}",
                        ack.error.unwrap_or_default()
                    )));
                }
                Answer::Unauthorized => {
                    return Err(ListenerError::Authentication(
                        "bearer token rejected during resubscribe".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn deliver(&self, events: Vec<WireEvent>) {
        for event in events {
            let target = self.channels.get(&event.channel).map(|entry| {
                (
                    entry.value().consumer.clone(),
                    entry.value().cursor.clone(),
                )
            });
            match target {
                Some((consumer, cursor)) => {
                    let message = event.into_inbound();
                    cursor.store(message.replay_id, Ordering::SeqCst);
                    consumer(message).await;
                }
                None => {
                    debug!(channel = %event.channel, "dropping event for unsubscribed channel");
                }
            }
        }
    }

    async fn subscribe_remote(&self, channel: &str, replay_from: i64) -> Result<()> {
        let token = self.config.tokens.current().await?;
        match self.subscribe_once(channel, replay_from, &token).await? {
            Answer::Ok(()) => Ok(()),
            Answer::Unauthorized => {
                self.reauthenticate(&token).await?;
                // The renewal pass skipped this channel (not acknowledged
                // yet), so retrying here cannot double-subscribe.
                let fresh = self.config.tokens.current().await?;
                match self.subscribe_once(channel, replay_from, &fresh).await? {
                    Answer::Ok(()) => Ok(()),
                    Answer::Unauthorized => Err(ListenerError::Authentication(
                        "subscribe rejected after credential refresh".to_string(),
                    )),
                }
            }
        }
    }

    async fn subscribe_once(
        &self,
        channel: &str,
        replay_from: i64,
        token: &BearerToken,
    ) -> Result<Answer<()>> {
        let client_id = self
            .client_id
            .read()
            .await
            .clone()
            .ok_or_else(|| ListenerError::Transport("no active session".to_string()))?;
        let request = SubscribeRequest {
            client_id: &client_id,
            channel,
            replay_from,
        };
        match self.post::<_, AckResponse>("subscribe", &request, token).await? {
            Answer::Ok(ack) if ack.successful => Ok(Answer::Ok(())),
            Answer::Ok(ack) => Err(ListenerError::Protocol(format!(
                "subscribe rejected: {}",
                ack.error.unwrap_or_default()
            ))),
            Answer::Unauthorized => Ok(Answer::Unauthorized),
        }
    }
}

#[async_trait]
impl StreamingConnector for LongPollConnector {
    async fn start(&self) -> Result<()> {
        if self.retired.load(Ordering::SeqCst) {
            return Err(ListenerError::Configuration(
                "connector cannot be restarted after stop".to_string(),
            ));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ListenerError::Configuration(
                "connector already started".to_string(),
            ));
        }
        let result = self.start_inner().await;
        if result.is_err() {
            self.running.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn subscribe(
        &self,
        channel: &str,
        replay_from: ReplayFrom,
        consumer: MessageConsumer,
    ) -> Result<SubscriptionHandle> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ListenerError::Configuration(
                "connector not started".to_string(),
            ));
        }
        // Register the consumer before the subscribe call goes out so events
        // arriving right after the acknowledgement find their channel.
        match self.channels.entry(channel.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ListenerError::Configuration(format!(
                    "already subscribed to {channel}"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ChannelState {
                    consumer,
                    cursor: Arc::new(AtomicI64::new(replay_from.wire_value())),
                    acked: AtomicBool::new(false),
                    needs_resubscribe: AtomicBool::new(false),
                });
            }
        }

        match self.subscribe_remote(channel, replay_from.wire_value()).await {
            Ok(()) => {
                if let Some(state) = self.channels.get(channel) {
                    state.acked.store(true, Ordering::SeqCst);
                }
                debug!(channel, replay = ?replay_from, "subscribed");
                Ok(SubscriptionHandle::new(
                    channel,
                    replay_from,
                    self.self_weak.clone(),
                ))
            }
            Err(err) => {
                self.channels.remove(channel);
                Err(err)
            }
        }
    }

    async fn unsubscribe(&self, channel: &str) -> Result<()> {
        let Some((name, state)) = self.channels.remove(channel) else {
            return Ok(());
        };
        if !state.acked.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(client_id) = self.client_id.read().await.clone() else {
            return Ok(());
        };
        let Ok(token) = self.config.tokens.current().await else {
            return Ok(());
        };
        let request = UnsubscribeRequest {
            client_id: &client_id,
            channel: &name,
        };
        // Local state is already gone; the remote call is best effort.
        match self.post::<_, AckResponse>("unsubscribe", &request, &token).await {
            Ok(Answer::Ok(ack)) if ack.successful => debug!(channel = %name, "unsubscribed"),
            Ok(_) | Err(_) => {
                debug!(channel = %name, "unsubscribe not acknowledged; local state cleared");
            }
        }
        Ok(())
    }

    async fn stop(&self) {
        self.retired.store(true, Ordering::SeqCst);
        let was_running = self.running.swap(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.poll_task.lock().await.take() {
            task.abort();
        }
        self.channels.clear();
        let client_id = self.client_id.write().await.take();
        if let Some(client_id) = client_id {
            if let Ok(token) = self.config.tokens.current().await {
                let request = DisconnectRequest {
                    client_id: &client_id,
                };
                match self.post::<_, AckResponse>("disconnect", &request, &token).await {
                    Ok(_) => debug!("disconnected from streaming endpoint"),
                    Err(err) => debug!(error = %err, "disconnect not delivered"),
                }
            }
        }
        if was_running {
            info!("streaming connector stopped");
        }
    }
}

impl Drop for LongPollConnector {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut task) = self.poll_task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

fn call_url(endpoint: &Url, call: &str) -> String {
    format!("{}/{call}", endpoint.as_str().trim_end_matches('/'))
}

enum Answer<T> {
    Ok(T),
    Unauthorized,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequest<'a> {
    client_id: &'a str,
    channel: &'a str,
    replay_from: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest<'a> {
    client_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnsubscribeRequest<'a> {
    client_id: &'a str,
    channel: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DisconnectRequest<'a> {
    client_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeResponse {
    successful: bool,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckResponse {
    successful: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectResponse {
    successful: bool,
    #[serde(default)]
    events: Vec<WireEvent>,
    #[serde(default)]
    error: Option<String>,
}

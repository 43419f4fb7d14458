//! Listener lifecycle and the handler-set registry.
//!
//! A [`CdcListener`] owns its registry, connector handle and subscriptions;
//! nothing is process-global, so independent listeners coexist in one
//! process. Lifecycle transitions run under a single mutex; the delivery
//! path only ever takes the registry read lock, so handlers may call back
//! into listener APIs (detach, stop) without wedging delivery.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{SessionNegotiator, TokenSource};
use crate::config::ListenerConfig;
use crate::dispatch::{parse_change_event, DispatchWorker, HandlerSet};
use crate::error::{ListenerError, Result};
use crate::transport::long_poll::LongPollConnector;
use crate::transport::tls;
use crate::transport::{
    InboundMessage, MessageConsumer, StreamingConnector, SubscriptionHandle, TransportConfig,
};

/// Opaque identity of one attached handler set, used to detach it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerSetId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Initialized,
    Running,
    Stopped,
}

struct ServiceRegistration {
    channel: String,
    replay_from: crate::config::ReplayFrom,
    handlers: Arc<HandlerSet>,
    worker: Arc<DispatchWorker>,
}

type Registry = Arc<RwLock<HashMap<HandlerSetId, ServiceRegistration>>>;

struct Lifecycle {
    state: ListenerState,
    connector: Option<Arc<LongPollConnector>>,
    subscriptions: Vec<SubscriptionHandle>,
}

/// Change-data-capture listener: negotiates a session, subscribes the
/// attached channel at the configured replay position, and dispatches each
/// decoded event to the matching handlers.
pub struct CdcListener {
    config: RwLock<ListenerConfig>,
    /// The channel the next start will subscribe. Last attach wins.
    channel: RwLock<Option<String>>,
    registry: Registry,
    lifecycle: Mutex<Lifecycle>,
}

impl CdcListener {
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            channel: RwLock::new(None),
            registry: Arc::new(RwLock::new(HashMap::new())),
            lifecycle: Mutex::new(Lifecycle {
                state: ListenerState::Initialized,
                connector: None,
                subscriptions: Vec::new(),
            }),
        }
    }

    /// Replaces the configuration without touching existing registrations.
    /// Rejected while running; the active transport already snapshotted the
    /// old configuration.
    pub async fn reconfigure(&self, config: ListenerConfig) -> Result<()> {
        let lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == ListenerState::Running {
            return Err(ListenerError::Configuration(
                "cannot reconfigure a running listener".to_string(),
            ));
        }
        *self.config.write().await = config;
        Ok(())
    }

    pub async fn state(&self) -> ListenerState {
        self.lifecycle.lock().await.state
    }

    /// Registers a handler set under `channel` and makes `channel` the
    /// listener's subscription target (last attach wins). An empty handler
    /// set is accepted and ignored.
    pub async fn attach(
        &self,
        handlers: HandlerSet,
        channel: impl Into<String>,
    ) -> Result<HandlerSetId> {
        let channel = channel.into();
        // Held across the state check and the registry insert so a concurrent
        // stop cannot slip in between and leave a registration on a stopped
        // listener.
        let lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == ListenerState::Stopped {
            return Err(ListenerError::Configuration(
                "listener is stopped".to_string(),
            ));
        }

        let id = HandlerSetId(Uuid::new_v4());
        if handlers.is_empty() {
            debug!(channel = %channel, "ignoring empty handler set");
            return Ok(id);
        }

        let (capacity, replay_from) = {
            let config = self.config.read().await;
            (config.dispatch_queue_capacity, config.replay_from)
        };
        let handlers = Arc::new(handlers);
        let worker = Arc::new(DispatchWorker::spawn(handlers.clone(), capacity));
        self.registry.write().await.insert(
            id,
            ServiceRegistration {
                channel: channel.clone(),
                replay_from,
                handlers,
                worker,
            },
        );
        *self.channel.write().await = Some(channel.clone());
        drop(lifecycle);
        debug!(channel = %channel, "handler set attached");
        Ok(id)
    }

    /// Removes a registration. Unknown ids are a no-op. When the last
    /// registration for a channel goes, its subscription is cancelled.
    pub async fn detach(&self, id: HandlerSetId) -> Result<()> {
        // Same discipline as attach: the lock covers the state check, the
        // registry removal and the subscription teardown.
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == ListenerState::Stopped {
            return Err(ListenerError::Configuration(
                "listener is stopped".to_string(),
            ));
        }

        let removed = self.registry.write().await.remove(&id);
        let Some(registration) = removed else {
            return Ok(());
        };
        debug!(
            channel = %registration.channel,
            replay = ?registration.replay_from,
            "handler set detached"
        );

        let channel_still_used = {
            let registry = self.registry.read().await;
            registry
                .values()
                .any(|r| r.channel == registration.channel)
        };
        if channel_still_used {
            return Ok(());
        }

        let handles = std::mem::take(&mut lifecycle.subscriptions);
        for handle in handles {
            if handle.channel() == registration.channel {
                if let Err(err) = handle.cancel().await {
                    warn!(error = %err, channel = %registration.channel, "subscription cancel failed");
                }
            } else {
                lifecycle.subscriptions.push(handle);
            }
        }
        Ok(())
    }

    /// Negotiates a session, builds a fresh transport, starts the connector
    /// and subscribes the attached channel. Both the connect phase and the
    /// subscribe acknowledgement are bounded by the configured connection
    /// timeout; on either bound elapsing the connector is torn down before
    /// the error is returned, so the listener is never left half started.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == ListenerState::Running {
            return Err(ListenerError::Configuration(
                "listener already running".to_string(),
            ));
        }

        let channel = self.channel.read().await.clone().ok_or_else(|| {
            ListenerError::Configuration("no channel attached".to_string())
        })?;
        let config = self.config.read().await.clone();

        let http = tls::build_http_client(config.secure_socket.as_ref(), config.read_timeout)?;
        let negotiator =
            SessionNegotiator::new(http.clone(), config.auth.clone(), config.api_version.clone());
        let tokens = Arc::new(TokenSource::new(negotiator));
        tokens.login().await?;
        let endpoint = tokens.streaming_endpoint().await?;

        let connector = LongPollConnector::new(TransportConfig {
            endpoint,
            api_version: config.api_version.clone(),
            keep_alive: config.keep_alive_interval,
            max_network_delay: config.read_timeout,
            http,
            tokens,
        });

        match timeout(config.connection_timeout, connector.start()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                connector.stop().await;
                return Err(err);
            }
            Err(_) => {
                connector.stop().await;
                return Err(ListenerError::ConnectionTimeout {
                    operation: "connect",
                    timeout: config.connection_timeout,
                });
            }
        }

        let consumer = delivery_consumer(self.registry.clone());
        let subscription = match timeout(
            config.connection_timeout,
            connector.subscribe(&channel, config.replay_from, consumer),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(err)) => {
                connector.stop().await;
                return Err(err);
            }
            Err(_) => {
                connector.stop().await;
                return Err(ListenerError::ConnectionTimeout {
                    operation: "subscribe",
                    timeout: config.connection_timeout,
                });
            }
        };

        lifecycle.connector = Some(connector);
        lifecycle.subscriptions = vec![subscription];
        lifecycle.state = ListenerState::Running;
        info!(channel = %channel, replay = ?config.replay_from, "listener running");
        Ok(())
    }

    /// Cancels the active subscription, then stops the connector. Every step
    /// is idempotent: stopping before starting, or twice in a row, is not an
    /// error.
    pub async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        let handles = std::mem::take(&mut lifecycle.subscriptions);
        for handle in handles {
            if let Err(err) = handle.cancel().await {
                debug!(error = %err, channel = handle.channel(), "subscription cancel during stop failed");
            }
        }
        if let Some(connector) = lifecycle.connector.take() {
            connector.stop().await;
        }
        if lifecycle.state == ListenerState::Running {
            info!("listener stopped");
        }
        lifecycle.state = ListenerState::Stopped;
        Ok(())
    }
}

fn delivery_consumer(registry: Registry) -> MessageConsumer {
    Arc::new(move |message: InboundMessage| -> BoxFuture<'static, ()> {
        let registry = registry.clone();
        Box::pin(async move { dispatch_message(registry, message).await })
    })
}

async fn dispatch_message(registry: Registry, message: InboundMessage) {
    let Some(event) = parse_change_event(&message.payload) else {
        debug!(
            channel = %message.channel,
            replay_id = message.replay_id,
            "dropping unclassifiable event"
        );
        return;
    };
    let workers: Vec<Arc<DispatchWorker>> = {
        let registry = registry.read().await;
        registry
            .values()
            .filter(|r| r.channel == message.channel)
            .filter(|r| r.handlers.handler_for(event.metadata.change_type).is_some())
            .map(|r| r.worker.clone())
            .collect()
    };
    if workers.is_empty() {
        debug!(
            channel = %message.channel,
            change_type = %event.metadata.change_type,
            "no handler registered for event"
        );
        return;
    }
    for worker in workers {
        worker.enqueue(event.clone()).await;
    }
}

//! Event classification and handler dispatch.
//!
//! An inbound payload carries a `ChangeEventHeader` naming the change type;
//! everything else in the payload is a changed field. Each registration owns
//! a bounded queue drained by one worker task, so per-registration delivery
//! stays in arrival order while a slow or panicking handler never stalls the
//! transport's delivery loop or any other registration.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CHANGE_EVENT_HEADER: &str = "ChangeEventHeader";

/// The four mutation kinds a change-data-capture stream reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    Undelete,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Create => "CREATE",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
            ChangeType::Undelete => "UNDELETE",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire form of the change-event header. Fields the platform omits fall back
/// to empty/zero; only the change type is load-bearing for classification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeEventHeader {
    change_type: ChangeType,
    #[serde(default)]
    commit_timestamp: i64,
    #[serde(default)]
    transaction_key: String,
    #[serde(default)]
    change_origin: String,
    #[serde(default)]
    entity_name: String,
    #[serde(default)]
    sequence_number: i64,
    #[serde(default)]
    commit_user: String,
    #[serde(default)]
    commit_number: i64,
    #[serde(default)]
    record_ids: Vec<String>,
}

/// Header-derived event metadata handed to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMetadata {
    pub commit_timestamp: i64,
    pub transaction_key: String,
    pub change_origin: String,
    pub change_type: ChangeType,
    pub entity_name: String,
    pub sequence_number: i64,
    pub commit_user: String,
    pub commit_number: i64,
    /// First entry of the header's `recordIds`, empty when absent.
    pub record_id: String,
}

/// A classified change event: the changed fields (stringified) plus the
/// header metadata. Built per inbound message and handed to each matching
/// handler by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub changed_fields: BTreeMap<String, String>,
    pub metadata: EventMetadata,
}

/// Classifies a raw payload. `None` means the payload carries no usable
/// header or an unrecognized change type; such events are dropped, not
/// errors.
pub(crate) fn parse_change_event(payload: &serde_json::Value) -> Option<ChangeEvent> {
    let fields = payload.as_object()?;
    let header: ChangeEventHeader =
        serde_json::from_value(fields.get(CHANGE_EVENT_HEADER)?.clone()).ok()?;

    let changed_fields = fields
        .iter()
        .filter(|(key, _)| key.as_str() != CHANGE_EVENT_HEADER)
        .map(|(key, value)| (key.clone(), stringify(value)))
        .collect();

    let record_id = header.record_ids.first().cloned().unwrap_or_default();
    Some(ChangeEvent {
        changed_fields,
        metadata: EventMetadata {
            commit_timestamp: header.commit_timestamp,
            transaction_key: header.transaction_key,
            change_origin: header.change_origin,
            change_type: header.change_type,
            entity_name: header.entity_name,
            sequence_number: header.sequence_number,
            commit_user: header.commit_user,
            commit_number: header.commit_number,
            record_id,
        },
    })
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Async callback invoked per matching change event.
pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) -> BoxFuture<'static, ()> + Send + Sync>;

fn boxed<F, Fut>(handler: F) -> ChangeHandler
where
    F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| -> BoxFuture<'static, ()> { Box::pin(handler(event)) })
}

/// One optional callback per change type. An empty set is legal and attaches
/// as a no-op.
#[derive(Clone, Default)]
pub struct HandlerSet {
    create: Option<ChangeHandler>,
    update: Option<ChangeHandler>,
    delete: Option<ChangeHandler>,
    undelete: Option<ChangeHandler>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.create = Some(boxed(handler));
        self
    }

    pub fn on_update<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.update = Some(boxed(handler));
        self
    }

    pub fn on_delete<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.delete = Some(boxed(handler));
        self
    }

    pub fn on_undelete<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.undelete = Some(boxed(handler));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.create.is_none()
            && self.update.is_none()
            && self.delete.is_none()
            && self.undelete.is_none()
    }

    pub(crate) fn handler_for(&self, change_type: ChangeType) -> Option<ChangeHandler> {
        match change_type {
            ChangeType::Create => self.create.clone(),
            ChangeType::Update => self.update.clone(),
            ChangeType::Delete => self.delete.clone(),
            ChangeType::Undelete => self.undelete.clone(),
        }
    }
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSet")
            .field("create", &self.create.is_some())
            .field("update", &self.update.is_some())
            .field("delete", &self.delete.is_some())
            .field("undelete", &self.undelete.is_some())
            .finish()
    }
}

/// Bounded queue plus the worker task draining it for one registration.
///
/// Dropping the worker closes the queue; the task drains what was already
/// accepted and exits. Each handler invocation runs in its own spawned task
/// so a panic is contained to that invocation.
pub(crate) struct DispatchWorker {
    queue: mpsc::Sender<ChangeEvent>,
}

impl DispatchWorker {
    pub(crate) fn spawn(handlers: Arc<HandlerSet>, capacity: usize) -> Self {
        let (queue, mut inbox) = mpsc::channel::<ChangeEvent>(capacity);
        tokio::spawn(async move {
            while let Some(event) = inbox.recv().await {
                let Some(handler) = handlers.handler_for(event.metadata.change_type) else {
                    continue;
                };
                let change_type = event.metadata.change_type;
                let entity = event.metadata.entity_name.clone();
                if let Err(join_err) = tokio::spawn(handler(event)).await {
                    if join_err.is_panic() {
                        warn!(
                            change_type = %change_type,
                            entity = %entity,
                            "handler panicked; continuing with next event"
                        );
                    }
                }
            }
        });
        Self { queue }
    }

    /// Queues an event for this registration, awaiting space when the queue
    /// is saturated. Sending into a closed queue (registration detached
    /// mid-delivery) drops the event.
    pub(crate) async fn enqueue(&self, event: ChangeEvent) {
        if self.queue.send(event).await.is_err() {
            debug!("registration gone; event dropped");
        }
    }
}

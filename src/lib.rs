//! Change-data-capture streaming listener for a remote CRM platform.
//!
//! The listener authenticates against the platform and opens a long-polling
//! streaming session; decoded change events are delivered to registered
//! per-change-type handlers. Provided:
//! - Username/password (SOAP login) and external OAuth2 token authentication
//! - Channel subscription at earliest, latest, or a specific replay offset
//! - Session renewal on token expiry without losing subscriptions
//! - Bounded per-registration dispatch queues with panic isolation
//! - Client TLS identity and custom trust anchors from PEM material
//!
//! ```no_run
//! use cdc_listener::{CdcListener, HandlerSet, ListenerConfig, ReplayFrom};
//!
//! # async fn run() -> cdc_listener::Result<()> {
//! let config = ListenerConfig::password("user@example.com", "secret")
//!     .with_replay_from(ReplayFrom::Latest);
//! let listener = CdcListener::new(config);
//!
//! let handlers = HandlerSet::new()
//!     .on_update(|event| async move {
//!         println!("{} changed: {:?}", event.metadata.entity_name, event.changed_fields);
//!     });
//! listener.attach(handlers, "/data/AccountChangeEvent").await?;
//!
//! listener.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod transport;

pub use config::{
    AuthConfig, KeyMaterial, ListenerConfig, ReplayFrom, SecureSocket, TokenFetcher, TrustMaterial,
};
pub use dispatch::{ChangeEvent, ChangeHandler, ChangeType, EventMetadata, HandlerSet};
pub use error::{ListenerError, Result};
pub use listener::{CdcListener, HandlerSetId, ListenerState};
pub use transport::{InboundMessage, MessageConsumer, StreamingConnector, SubscriptionHandle};

use std::fmt;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::auth::session::SessionNegotiator;
use crate::error::{ListenerError, Result};

/// A bearer token tagged with the generation of the negotiation that produced
/// it. Replaced wholesale on refresh, never mutated in place.
#[derive(Clone)]
pub struct BearerToken {
    value: String,
    generation: u64,
}

impl BearerToken {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &"<redacted>")
            .field("generation", &self.generation)
            .finish()
    }
}

struct SessionState {
    token: BearerToken,
    streaming_endpoint: Url,
}

/// Memoizing credential source shared between the listener and its transport.
///
/// `current` hands out the cached token without touching the network.
/// `refresh` re-negotiates, but holds a dedicated lock so that concurrent
/// callers reacting to the same expiry produce exactly one new session: the
/// loser of the race observes a newer generation than the token it brought
/// and takes the fresh token without a second round trip.
pub struct TokenSource {
    negotiator: SessionNegotiator,
    state: RwLock<Option<SessionState>>,
    refresh_lock: Mutex<()>,
}

impl TokenSource {
    pub fn new(negotiator: SessionNegotiator) -> Self {
        Self {
            negotiator,
            state: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// First acquisition. Negotiates a session, caches it, and returns the
    /// token. Calling again re-negotiates and replaces the cached session.
    pub async fn login(&self) -> Result<BearerToken> {
        let _guard = self.refresh_lock.lock().await;
        self.negotiate_and_store().await
    }

    /// The cached token. Never a network call.
    pub async fn current(&self) -> Result<BearerToken> {
        let state = self.state.read().await;
        state
            .as_ref()
            .map(|s| s.token.clone())
            .ok_or_else(|| ListenerError::Authentication("no session established".to_string()))
    }

    /// Streaming endpoint resolved by the last negotiation.
    pub async fn streaming_endpoint(&self) -> Result<Url> {
        let state = self.state.read().await;
        state
            .as_ref()
            .map(|s| s.streaming_endpoint.clone())
            .ok_or_else(|| ListenerError::Authentication("no session established".to_string()))
    }

    /// Exchanges a stale token for a fresh one. Safe to call concurrently;
    /// only one caller per expiry actually re-negotiates.
    pub async fn refresh(&self, stale: &BearerToken) -> Result<BearerToken> {
        let _guard = self.refresh_lock.lock().await;
        {
            let state = self.state.read().await;
            if let Some(current) = state.as_ref() {
                if current.token.generation > stale.generation {
                    debug!(
                        generation = current.token.generation,
                        "token already refreshed by a concurrent caller"
                    );
                    return Ok(current.token.clone());
                }
            }
        }
        self.negotiate_and_store().await
    }

    // Caller must hold refresh_lock.
    async fn negotiate_and_store(&self) -> Result<BearerToken> {
        let session = self.negotiator.negotiate().await?;
        let mut state = self.state.write().await;
        let generation = state.as_ref().map(|s| s.token.generation).unwrap_or(0) + 1;
        let token = BearerToken {
            value: session.bearer_token,
            generation,
        };
        info!(
            generation,
            endpoint = %session.streaming_endpoint,
            "session negotiated"
        );
        *state = Some(SessionState {
            token: token.clone(),
            streaming_endpoint: session.streaming_endpoint,
        });
        Ok(token)
    }
}

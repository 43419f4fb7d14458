use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ListenerError>;

/// Failure taxonomy for the listener and its transport.
///
/// Handler-level failures are deliberately absent: a panicking or failing
/// handler is contained by the dispatcher and never surfaces here.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Login or token acquisition failed. Carries the server-reported fault
    /// text when the platform supplied one.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The connect or subscribe phase exceeded its configured bound. The
    /// connector is always torn down before this is returned.
    #[error("{operation} timed out after {timeout:?}")]
    ConnectionTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The server answered, but not with anything we can use (missing session
    /// id or server URL, undecodable streaming payload).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The listener was asked to do something its configuration cannot
    /// support: no channel attached before start, unusable TLS material,
    /// lifecycle misuse.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network-level failure outside the typed cases above.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ListenerError {
    /// Whether retrying the failed operation could plausibly succeed without
    /// a configuration change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ListenerError::ConnectionTimeout { .. } | ListenerError::Transport(_)
        )
    }
}

impl From<reqwest::Error> for ListenerError {
    fn from(err: reqwest::Error) -> Self {
        ListenerError::Transport(err.to_string())
    }
}

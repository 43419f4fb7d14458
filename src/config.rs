use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

/// Replay position for a channel subscription.
///
/// The platform reserves two sentinel offsets: `-2` replays every event the
/// server still retains, `-1` delivers new events only. Anything else resumes
/// strictly after that commit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayFrom {
    Earliest,
    Latest,
    Offset(i64),
}

impl ReplayFrom {
    pub fn wire_value(self) -> i64 {
        match self {
            ReplayFrom::Earliest => -2,
            ReplayFrom::Latest => -1,
            ReplayFrom::Offset(n) => n,
        }
    }
}

impl Default for ReplayFrom {
    fn default() -> Self {
        ReplayFrom::Latest
    }
}

/// Synchronous token-fetch callback supplied by OAuth2 integrations. Invoked
/// off the async runtime; each call must return a currently valid access
/// token.
pub type TokenFetcher = Arc<
    dyn Fn() -> std::result::Result<String, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// How the listener obtains its bearer token. The two mechanisms are mutually
/// exclusive by construction.
#[derive(Clone)]
pub enum AuthConfig {
    /// Username/password login against the platform's SOAP login service.
    Password {
        username: String,
        password: SecretString,
        /// Sandbox orgs log in against the test host instead of production.
        sandbox: bool,
        /// Overrides the host picked by `sandbox`. Used by tests to point the
        /// login flow at a local server.
        login_url: Option<Url>,
    },
    /// Externally managed OAuth2 tokens: the integration supplies a fetch
    /// callback and the instance base URL the session would otherwise have
    /// reported.
    OAuth {
        base_url: Url,
        token_fetcher: TokenFetcher,
    },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::Password {
                username,
                sandbox,
                login_url,
                ..
            } => f
                .debug_struct("Password")
                .field("username", username)
                .field("sandbox", sandbox)
                .field("login_url", login_url)
                .finish_non_exhaustive(),
            AuthConfig::OAuth { base_url, .. } => f
                .debug_struct("OAuth")
                .field("base_url", &base_url.as_str())
                .finish_non_exhaustive(),
        }
    }
}

/// Client-side TLS key material. Either a single PEM bundle holding the
/// certificate chain and private key, or separate certificate and key files.
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    Bundle {
        path: PathBuf,
        password: Option<SecretString>,
    },
    Files {
        cert_path: PathBuf,
        key_path: PathBuf,
        key_password: Option<SecretString>,
    },
}

/// Server trust anchors: a PEM bundle on disk or in-memory PEM text.
#[derive(Debug, Clone)]
pub enum TrustMaterial {
    File { path: PathBuf },
    Pem(String),
}

/// TLS configuration for the streaming and login connections.
#[derive(Debug, Clone, Default)]
pub struct SecureSocket {
    pub key: Option<KeyMaterial>,
    pub trust: Option<TrustMaterial>,
}

pub const DEFAULT_API_VERSION: &str = "58.0";
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(40);
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_DISPATCH_QUEUE_CAPACITY: usize = 1024;

/// Listener configuration. Construct with [`ListenerConfig::password`] or
/// [`ListenerConfig::oauth`], then adjust with the `with_` setters.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub auth: AuthConfig,
    pub replay_from: ReplayFrom,
    /// Platform API version, e.g. `"58.0"`. Selects the streaming endpoint
    /// path flavor.
    pub api_version: String,
    /// Bound on the connect phase and on each subscribe acknowledgement.
    pub connection_timeout: Duration,
    /// Per-request network guard on the long-poll connection. Must exceed
    /// `keep_alive_interval`, or every idle poll would be cut short.
    pub read_timeout: Duration,
    /// How long the server may hold an idle long-poll before answering empty.
    pub keep_alive_interval: Duration,
    pub secure_socket: Option<SecureSocket>,
    /// Capacity of each registration's dispatch queue. A full queue applies
    /// backpressure to the delivery loop instead of dropping events.
    pub dispatch_queue_capacity: usize,
}

impl ListenerConfig {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::with_auth(AuthConfig::Password {
            username: username.into(),
            password: SecretString::from(password.into()),
            sandbox: false,
            login_url: None,
        })
    }

    pub fn oauth<F>(base_url: Url, token_fetcher: F) -> Self
    where
        F: Fn() -> std::result::Result<String, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        Self::with_auth(AuthConfig::OAuth {
            base_url,
            token_fetcher: Arc::new(token_fetcher),
        })
    }

    fn with_auth(auth: AuthConfig) -> Self {
        Self {
            auth,
            replay_from: ReplayFrom::default(),
            api_version: DEFAULT_API_VERSION.to_string(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            secure_socket: None,
            dispatch_queue_capacity: DEFAULT_DISPATCH_QUEUE_CAPACITY,
        }
    }

    /// Log in against the sandbox host. Only meaningful for password auth.
    pub fn with_sandbox(mut self, enabled: bool) -> Self {
        if let AuthConfig::Password { sandbox, .. } = &mut self.auth {
            *sandbox = enabled;
        }
        self
    }

    /// Point password login at an explicit host instead of the one selected
    /// by the sandbox flag.
    pub fn with_login_url(mut self, url: Url) -> Self {
        if let AuthConfig::Password { login_url, .. } = &mut self.auth {
            *login_url = Some(url);
        }
        self
    }

    pub fn with_replay_from(mut self, replay_from: ReplayFrom) -> Self {
        self.replay_from = replay_from;
        self
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn with_secure_socket(mut self, secure_socket: SecureSocket) -> Self {
        self.secure_socket = Some(secure_socket);
        self
    }

    pub fn with_dispatch_queue_capacity(mut self, capacity: usize) -> Self {
        self.dispatch_queue_capacity = capacity.max(1);
        self
    }
}

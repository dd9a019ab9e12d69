//! Client configuration.
//!
//! Values come from the builder methods or from `COLLAB_*` environment
//! variables (a `.env` file is honoured by the demo binary through dotenvy).

use std::time::Duration;

/// Default remote host
pub const DEFAULT_HOST: &str = "localhost";

/// Default remote port
pub const DEFAULT_PORT: u16 = 50053;

/// Configuration for a session and everything it spawns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Account name used to authenticate
    pub username: String,
    /// Account password
    pub password: String,
    /// Remote host (without scheme)
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Whether the endpoint is reached over TLS
    pub tls: bool,
    /// How long leave/detach wait for unacknowledged operations
    pub drain_timeout: Duration,
    /// How long attach waits for the first authoritative snapshot
    pub request_timeout: Duration,
    /// Capacity of event and presence broadcast channels
    pub channel_capacity: usize,
    /// Parked remote operations tolerated per buffer before it resyncs
    pub max_pending_ops: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls: true,
            drain_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            channel_capacity: 256,
            max_pending_ops: 4096,
        }
    }
}

impl Config {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Build from `COLLAB_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        Self {
            username: env("COLLAB_USERNAME").unwrap_or(defaults.username),
            password: env("COLLAB_PASSWORD").unwrap_or(defaults.password),
            host: env("COLLAB_HOST").unwrap_or(defaults.host),
            port: env("COLLAB_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            tls: env("COLLAB_TLS")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
                .unwrap_or(defaults.tls),
            drain_timeout: env("COLLAB_DRAIN_TIMEOUT_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_timeout),
            ..defaults
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_max_pending_ops(mut self, max: usize) -> Self {
        self.max_pending_ops = max;
        self
    }

    /// Full endpoint URL derived from host, port and TLS flag
    pub fn endpoint(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

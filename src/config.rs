//! Per-connection configuration.
//!
//! A [`ConnectionConfig`] captures every immutable parameter of one broker
//! link. Construction goes through [`ConnectionConfig::new`] plus chained
//! setters; validation happens once, at registry time, and fails fast with
//! typed errors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::publish::{DEFAULT_QUEUE_DEPTH, PublishPolicy};

/// Default broker port (TLS).
pub const DEFAULT_PORT: u16 = 5671;
/// Default heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT: u16 = 600;
/// Default number of unacknowledged deliveries the broker may have in
/// flight.
pub const DEFAULT_PREFETCH: u16 = 10;
/// Default number of initial connection attempts before a critical
/// connection escalates.
pub const DEFAULT_INITIAL_RETRY_BUDGET: u32 = 8;

/// Username and password presented to the broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Account name.
    pub username: String,
    /// Account secret.
    pub password: String,
}

/// Reconnect backoff tuning.
///
/// Defaults are deliberately conservative: quick first retries with some
/// spread so a rebooting broker is not hit by every client at once, slowing
/// multiplicatively toward the cap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Lower bound of the randomized first retry delay.
    pub initial_min: Duration,
    /// Upper bound of the randomized first retry delay.
    pub initial_max: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub factor: f64,
    /// Random increment applied on top of each delay, as a fraction of it.
    pub jitter: f64,
    /// Longest delay between attempts.
    pub max: Duration,
    /// How long a connection must stay up before the backoff resets to the
    /// initial delay.
    pub stability_reset: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_min: Duration::from_millis(500),
            initial_max: Duration::from_secs(2),
            factor: 1.6,
            jitter: 0.25,
            max: Duration::from_secs(60),
            stability_reset: Duration::from_secs(60),
        }
    }
}

/// Immutable parameters of one broker connection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Broker hostname or IP address.
    pub host: String,
    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Virtual host to attach to.
    pub virtual_host: String,
    /// Credentials; absence means an anonymous connection.
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Whether to wrap the socket in TLS.
    #[serde(default = "default_true")]
    pub use_tls: bool,
    /// Identity of this client, unique within a registry.
    pub client_id: String,
    /// Heartbeat interval in seconds.
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u16,
    /// Unacknowledged-delivery window requested from the broker.
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
    /// When set, exhausting the initial connection retry budget is fatal to
    /// the whole process rather than silently retried forever.
    #[serde(default)]
    pub critical: bool,
    /// Number of initial connection attempts before a critical connection
    /// escalates.
    #[serde(default = "default_retry_budget")]
    pub initial_retry_budget: u32,
    /// Reconnect backoff tuning.
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Depth of each outbound publish queue.
    #[serde(default = "default_queue_depth")]
    pub publish_queue_depth: usize,
    /// Optional outbound rate limit, messages per second.
    #[serde(default)]
    pub publish_rate: Option<usize>,
    /// Behaviour when a publish queue is full.
    #[serde(default)]
    pub publish_policy: PublishPolicy,
}

fn default_port() -> u16 { DEFAULT_PORT }
fn default_true() -> bool { true }
fn default_heartbeat() -> u16 { DEFAULT_HEARTBEAT }
fn default_prefetch() -> u16 { DEFAULT_PREFETCH }
fn default_retry_budget() -> u32 { DEFAULT_INITIAL_RETRY_BUDGET }
fn default_queue_depth() -> usize { DEFAULT_QUEUE_DEPTH }

impl ConnectionConfig {
    /// Create a config with the mandatory parameters and defaults for the
    /// rest.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        virtual_host: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            virtual_host: virtual_host.into(),
            credentials: None,
            use_tls: true,
            client_id: client_id.into(),
            heartbeat: DEFAULT_HEARTBEAT,
            prefetch_count: DEFAULT_PREFETCH,
            critical: false,
            initial_retry_budget: DEFAULT_INITIAL_RETRY_BUDGET,
            backoff: BackoffConfig::default(),
            publish_queue_depth: DEFAULT_QUEUE_DEPTH,
            publish_rate: None,
            publish_policy: PublishPolicy::default(),
        }
    }

    /// Set the broker port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Authenticate with the given username and password.
    ///
    /// Empty strings are treated as "no credentials", matching the broker's
    /// anonymous login convention.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        let username = username.into();
        let password = password.into();
        self.credentials = if username.is_empty() || password.is_empty() {
            None
        } else {
            Some(Credentials { username, password })
        };
        self
    }

    /// Enable or disable TLS.
    #[must_use]
    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Set the heartbeat interval in seconds.
    #[must_use]
    pub fn heartbeat(mut self, seconds: u16) -> Self {
        self.heartbeat = seconds;
        self
    }

    /// Set the prefetch window.
    #[must_use]
    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Mark this link as load-bearing for the whole process.
    #[must_use]
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Set the initial connection retry budget.
    #[must_use]
    pub fn initial_retry_budget(mut self, attempts: u32) -> Self {
        self.initial_retry_budget = attempts;
        self
    }

    /// Override the backoff tuning.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Limit outbound publishes to `rate` messages per second.
    #[must_use]
    pub fn publish_rate(mut self, rate: usize) -> Self {
        self.publish_rate = Some(rate);
        self
    }

    /// Username presented to the broker, if any.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.username.as_str())
    }

    /// Check the mandatory parameters.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first missing parameter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.port == 0 {
            return Err(ConfigError::MissingPort);
        }
        if self.virtual_host.is_empty() {
            return Err(ConfigError::MissingVirtualHost);
        }
        if self.client_id.is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        Ok(())
    }
}

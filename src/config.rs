//! Bridge configuration.
//!
//! Plain structs with defaults. [`BridgeConfig::from_env`] layers the
//! `CALLBRIDGE_*` environment variables on top of the defaults:
//!
//! | Variable                 | Effect                                   |
//! |--------------------------|------------------------------------------|
//! | `CALLBRIDGE_ENDPOINT`    | endpoint URL (`tcp://`, `host:port`, `unix://`) |
//! | `CALLBRIDGE_QUEUE_DEPTH` | queue calls made while disconnected; `0` disables |
//! | `CALLBRIDGE_RECONNECT`   | `on`/`off` automatic reconnection        |

use std::time::Duration;

use tracing::warn;

use crate::error::Result;
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::transport::{Endpoint, DEFAULT_CONNECT_TIMEOUT};
use crate::writer::WriterConfig;

/// Default capacity of the disconnected-call queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Default first reconnect delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default reconnect delay ceiling.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Default growth factor between reconnect attempts.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

pub const ENV_ENDPOINT: &str = "CALLBRIDGE_ENDPOINT";
pub const ENV_QUEUE_DEPTH: &str = "CALLBRIDGE_QUEUE_DEPTH";
pub const ENV_RECONNECT: &str = "CALLBRIDGE_RECONNECT";

/// Queue for calls issued while the connection is not open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// When false, calls made while disconnected fail with `NotConnected`.
    pub enabled: bool,
    /// Maximum queued calls; the next one fails with `QueueFull`.
    pub depth: usize,
}

impl QueueConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            depth: 0,
        }
    }

    pub fn with_depth(depth: usize) -> Self {
        Self {
            enabled: true,
            depth,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Automatic reconnection with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Delay before the first attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::enabled()
        }
    }

    pub fn enabled() -> Self {
        Self {
            enabled: true,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_attempts: None,
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Delay before attempt `attempt` (1-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let backoff = self.initial_backoff.as_secs_f64() * multiplier;
        if !backoff.is_finite() || backoff >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(backoff)
    }

    /// Whether another attempt is allowed after `failed` failures.
    pub fn allows(&self, failed: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| failed < max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Configuration of a [`Bridge`](crate::Bridge).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Remote endpoint. Required before `connect()`.
    pub endpoint: Option<Endpoint>,
    pub queue: QueueConfig,
    pub reconnect: ReconnectPolicy,
    pub writer: WriterConfig,
    pub connect_timeout: Duration,
    /// Largest accepted inbound payload.
    pub max_payload: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            queue: QueueConfig::default(),
            reconnect: ReconnectPolicy::default(),
            writer: WriterConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_payload: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl BridgeConfig {
    /// Defaults overridden by the `CALLBRIDGE_*` environment variables.
    ///
    /// # Errors
    ///
    /// `InvalidEndpoint` if `CALLBRIDGE_ENDPOINT` is set but unparsable.
    /// Malformed queue or reconnect values are logged and ignored.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_ENDPOINT) {
            config.endpoint = Some(Endpoint::parse(&url)?);
        }

        if let Some(depth) = lookup(ENV_QUEUE_DEPTH) {
            match depth.trim().parse::<usize>() {
                Ok(0) => config.queue = QueueConfig::disabled(),
                Ok(depth) => config.queue = QueueConfig::with_depth(depth),
                Err(_) => warn!(value = %depth, "ignoring invalid {}", ENV_QUEUE_DEPTH),
            }
        }

        if let Some(flag) = lookup(ENV_RECONNECT) {
            match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => config.reconnect = ReconnectPolicy::enabled(),
                "0" | "false" | "off" | "no" => config.reconnect = ReconnectPolicy::disabled(),
                _ => warn!(value = %flag, "ignoring invalid {}", ENV_RECONNECT),
            }
        }

        Ok(config)
    }
}

//! Channel configuration.
//!
//! Options can be built in code or loaded from a TOML document:
//!
//! ```toml
//! timeout_ms = 5000
//! private = true
//!
//! [broadcast]
//! ack = true
//! self = false
//!
//! [presence]
//! key = "user-42"
//! ```
//!
//! The default push timeout can also be set with `TETHER_TIMEOUT_MS`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default push timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Rejoin delays for the first attempts, in milliseconds.
pub const REJOIN_INTERVALS_MS: [u64; 4] = [1_000, 2_000, 5_000, 10_000];

/// Rejoin delay once [`REJOIN_INTERVALS_MS`] is exhausted.
pub const DEFAULT_REJOIN_FALLBACK_MS: u64 = 10_000;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The config document is not valid TOML or has wrong types.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Channel options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Default timeout for pushes, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Broadcast settings.
    #[serde(default)]
    pub broadcast: BroadcastOptions,

    /// Presence settings.
    #[serde(default)]
    pub presence: PresenceOptions,

    /// Whether the channel requires authorization.
    #[serde(default)]
    pub private: bool,
}

/// Broadcast settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOptions {
    /// Wait for the server to acknowledge each broadcast.
    #[serde(default)]
    pub ack: bool,

    /// Receive our own broadcasts.
    #[serde(default, rename = "self")]
    pub echo_self: bool,
}

/// Presence settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceOptions {
    /// Key identifying this client in the presence state.
    #[serde(default)]
    pub key: String,
}

fn default_timeout_ms() -> u64 {
    std::env::var("TETHER_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_TIMEOUT_MS)
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            broadcast: BroadcastOptions::default(),
            presence: PresenceOptions::default(),
            private: false,
        }
    }
}

impl ChannelOptions {
    /// Get the default push timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Set the default push timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Require server acknowledgment of broadcasts.
    #[must_use]
    pub fn with_broadcast_ack(mut self, ack: bool) -> Self {
        self.broadcast.ack = ack;
        self
    }

    /// Receive our own broadcasts.
    #[must_use]
    pub fn with_broadcast_self(mut self, echo_self: bool) -> Self {
        self.broadcast.echo_self = echo_self;
        self
    }

    /// Set the presence key.
    #[must_use]
    pub fn with_presence_key(mut self, key: impl Into<String>) -> Self {
        self.presence.key = key.into();
        self
    }

    /// Mark the channel as private.
    #[must_use]
    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    /// Parse options from a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be parsed.
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(document)?)
    }

    /// Load options from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }
}

/// Default rejoin backoff.
///
/// Attempt `n` (starting at 1) waits `REJOIN_INTERVALS_MS[n - 1]`, then
/// [`DEFAULT_REJOIN_FALLBACK_MS`] for every later attempt.
#[must_use]
pub fn default_reconnect_after(tries: u32) -> Duration {
    let millis = tries
        .checked_sub(1)
        .and_then(|i| REJOIN_INTERVALS_MS.get(i as usize))
        .copied()
        .unwrap_or(DEFAULT_REJOIN_FALLBACK_MS);
    Duration::from_millis(millis)
}

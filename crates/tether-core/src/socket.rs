//! Socket abstraction.
//!
//! A channel never owns the connection. It talks to the multiplexing
//! socket through the [`Socket`] trait, which the host application
//! implements on top of its transport.

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tether_protocol::Frame;
use thiserror::Error;
use tracing::debug;

use crate::options::default_reconnect_after;

/// Socket errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    /// The socket refused the frame because its send budget is exhausted.
    #[error("Rate limited")]
    RateLimited,

    /// The connection is closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The frame could not be written.
    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// The connection shared by every channel.
///
/// Implementations must be cheap to call; channels invoke these methods
/// from within their own event handling.
pub trait Socket: Send + Sync {
    /// Check if the connection is open.
    fn is_connected(&self) -> bool;

    /// Hand a frame to the connection.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::RateLimited`] when the frame was refused by
    /// the rate limiter, or another error if it could not be written.
    fn push(&self, frame: Frame) -> Result<(), SocketError>;

    /// Allocate a fresh, connection-unique message reference.
    fn make_ref(&self) -> String;

    /// Get the current bearer token.
    fn access_token(&self) -> Option<String> {
        None
    }

    /// Apply a bearer token to the connection and its joined channels.
    fn set_auth(&self, _token: Option<String>) {}

    /// Delay before rejoin attempt `tries` (starting at 1).
    fn reconnect_after(&self, tries: u32) -> Duration {
        default_reconnect_after(tries)
    }

    /// Drop a closed channel from the socket's registry.
    fn remove(&self, _topic: &str) {}

    /// Leave any other joined channel using `topic` before it is rejoined.
    fn leave_open_topic(&self, _topic: &str) {}

    /// Whether [`Socket::log`] should be called at all.
    fn has_logger(&self) -> bool {
        true
    }

    /// Diagnostic log sink.
    fn log(&self, kind: &str, message: &str, data: Option<&Value>) {
        match data {
            Some(data) => debug!(kind, data = %data, "{}", message),
            None => debug!(kind, "{}", message),
        }
    }
}

impl fmt::Debug for dyn Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Monotonic message reference generator.
///
/// Produces `"1"`, `"2"`, ... Suitable as the backing of
/// [`Socket::make_ref`].
#[derive(Debug, Default)]
pub struct RefCounter {
    next: AtomicU64,
}

impl RefCounter {
    /// Create a counter starting at `"1"`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the next reference.
    pub fn next_ref(&self) -> String {
        (self.next.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

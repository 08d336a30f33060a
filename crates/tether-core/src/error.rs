//! Channel errors.

use serde_json::Value;
use thiserror::Error;

/// Broad category of a [`ChannelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The API contract was violated by the caller. Never retried.
    Misuse,
    /// Client and server disagree about the channel configuration.
    Protocol,
    /// Network or server failure. The channel rejoins on its own.
    Transient,
}

/// Channel errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    /// Invalid topic name.
    #[error("Invalid topic: {0}")]
    InvalidTopic(&'static str),

    /// `subscribe` was called more than once on the same channel.
    #[error("Tried to subscribe multiple times to '{0}'; subscribe can only be called once per channel instance")]
    AlreadySubscribed(String),

    /// A push was attempted before `subscribe`.
    #[error("Tried to push '{event}' to '{topic}' before joining; call subscribe() first")]
    PushBeforeJoin {
        /// Channel topic.
        topic: String,
        /// Event of the rejected push.
        event: String,
    },

    /// The message hook dropped a non-empty payload.
    #[error("Message hook dropped the payload of '{0}'; hooks must return the payload, modified or unmodified")]
    PayloadDropped(String),

    /// Server-confirmed postgres filters differ from the declared ones.
    #[error("Mismatch between server and client bindings for postgres changes")]
    PostgresMismatch,

    /// The server rejected a request or reported a channel error.
    #[error("Server error: {0}")]
    Server(String),

    /// The push was discarded before any reply arrived.
    #[error("Push discarded before a reply was received")]
    Canceled,
}

impl ChannelError {
    /// Get the category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::InvalidTopic(_)
            | ChannelError::AlreadySubscribed(_)
            | ChannelError::PushBeforeJoin { .. }
            | ChannelError::PayloadDropped(_) => ErrorKind::Misuse,
            ChannelError::PostgresMismatch => ErrorKind::Protocol,
            ChannelError::Server(_) | ChannelError::Canceled => ErrorKind::Transient,
        }
    }

    /// Check if this error reports a contract violation by the caller.
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        self.kind() == ErrorKind::Misuse
    }

    /// Build a [`ChannelError::Server`] from a server response body.
    ///
    /// Object bodies are flattened to their values joined by `", "`.
    #[must_use]
    pub fn from_response(response: &Value) -> Self {
        let detail = match response {
            Value::Object(map) => map
                .values()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", "),
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };

        if detail.is_empty() {
            ChannelError::Server("error".to_string())
        } else {
            ChannelError::Server(detail)
        }
    }
}

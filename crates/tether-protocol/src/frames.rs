//! Frame types for the tether channel protocol.
//!
//! Every message exchanged over the shared connection is a [`Frame`]
//! addressed to a topic. Replies to pushes travel as `phx_reply` frames
//! whose payload is a [`Reply`]: a [`ReplyStatus`] plus a response body.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Reserved channel lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    /// Join request sent by the client.
    Join,
    /// Leave request sent by the client.
    Leave,
    /// Reply correlated to a previously sent push.
    Reply,
    /// The server closed the channel.
    Close,
    /// The channel crashed or the connection dropped.
    Error,
    /// Refreshed bearer token for an already joined channel.
    AccessToken,
    /// Connection keepalive.
    Heartbeat,
}

impl ChannelEvent {
    /// Get the wire name of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelEvent::Join => "phx_join",
            ChannelEvent::Leave => "phx_leave",
            ChannelEvent::Reply => "phx_reply",
            ChannelEvent::Close => "phx_close",
            ChannelEvent::Error => "phx_error",
            ChannelEvent::AccessToken => "access_token",
            ChannelEvent::Heartbeat => "heartbeat",
        }
    }

    /// Parse a wire event name, ignoring ASCII case.
    #[must_use]
    pub fn parse(event: &str) -> Option<Self> {
        [
            ChannelEvent::Join,
            ChannelEvent::Leave,
            ChannelEvent::Reply,
            ChannelEvent::Close,
            ChannelEvent::Error,
            ChannelEvent::AccessToken,
            ChannelEvent::Heartbeat,
        ]
        .into_iter()
        .find(|e| e.as_str().eq_ignore_ascii_case(event))
    }
}

impl fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status carried by a reply.
///
/// `ok`, `error` and `timeout` are the standard outcomes; servers may echo
/// any other status, which is preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ReplyStatus {
    Ok,
    Error,
    Timeout,
    Other(String),
}

impl ReplyStatus {
    /// Get the wire name of the status.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Error => "error",
            ReplyStatus::Timeout => "timeout",
            ReplyStatus::Other(s) => s,
        }
    }
}

impl From<&str> for ReplyStatus {
    fn from(value: &str) -> Self {
        match value {
            "ok" => ReplyStatus::Ok,
            "error" => ReplyStatus::Error,
            "timeout" => ReplyStatus::Timeout,
            other => ReplyStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for ReplyStatus {
    fn from(value: String) -> Self {
        ReplyStatus::from(value.as_str())
    }
}

impl From<ReplyStatus> for String {
    fn from(status: ReplyStatus) -> String {
        match status {
            ReplyStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a `phx_reply` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Outcome of the push.
    pub status: ReplyStatus,
    /// Status-specific response body.
    #[serde(default)]
    pub response: Value,
}

impl Reply {
    /// Create a new reply.
    #[must_use]
    pub fn new(status: impl Into<ReplyStatus>, response: Value) -> Self {
        Self {
            status: status.into(),
            response,
        }
    }
}

/// A protocol frame.
///
/// Outbound frames always carry a `ref`; `join_ref` scopes the frame to a
/// particular join attempt of its channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Topic of the channel the frame belongs to.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
    /// Correlation reference of the push.
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    /// Reference of the join attempt the frame belongs to.
    #[serde(default)]
    pub join_ref: Option<String>,
}

impl Frame {
    /// Create a frame without references.
    #[must_use]
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: None,
            join_ref: None,
        }
    }

    /// Set the correlation reference.
    #[must_use]
    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Set the join reference.
    #[must_use]
    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    /// Create a `phx_reply` frame answering the push with `reference`.
    #[must_use]
    pub fn reply(
        topic: impl Into<String>,
        reference: impl Into<String>,
        status: impl Into<ReplyStatus>,
        response: Value,
    ) -> Self {
        let body = Reply::new(status, response);
        let payload = serde_json::to_value(&body).unwrap_or(Value::Null);
        Frame::new(topic, ChannelEvent::Reply.as_str(), payload).with_ref(reference)
    }

    /// Get the reserved lifecycle event of this frame, if any.
    #[must_use]
    pub fn channel_event(&self) -> Option<ChannelEvent> {
        ChannelEvent::parse(&self.event)
    }

    /// Check if this frame is a reply to a push.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.channel_event() == Some(ChannelEvent::Reply)
    }

    /// Parse the payload of a reply frame.
    ///
    /// Returns `None` for non-reply frames or malformed reply bodies.
    #[must_use]
    pub fn as_reply(&self) -> Option<Reply> {
        if !self.is_reply() {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

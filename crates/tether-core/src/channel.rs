//! Channel state machine.
//!
//! A [`Channel`] is the client-side handle to one topic of a shared
//! socket. It joins and leaves the topic, buffers pushes until it is
//! joined, rejoins with backoff after errors, and dispatches inbound
//! events to its bindings.
//!
//! ```text
//!                subscribe / rejoin
//!   Closed ──────────────────────────► Joining ──── join ok ───► Joined
//!     ▲                                 ▲   │                      │
//!     │ leave ok / timeout              │   │ join timeout         │ phx_error
//!     │                      rejoin     │   ▼                      ▼
//!   Leaving ◄── unsubscribe ───────── Errored ◄────────────────────┘
//! ```
//!
//! Every public operation, inbound event, timer firing and push timeout
//! runs as one reaction under the channel's reaction lock, so state
//! changes never interleave.

use parking_lot::{Mutex, ReentrantMutex};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_protocol::{ChannelEvent, Frame, ReplyStatus};
use tracing::{debug, trace, warn};

use crate::binding::{
    enrich_postgres_payload, BindingFilter, Bindings, Callback, EventFilter, EventType,
    PostgresChangesFilter, ServerPostgresFilter,
};
use crate::error::ChannelError;
use crate::metrics;
use crate::options::ChannelOptions;
use crate::presence::{Presence, PresenceChange, PresenceMap};
use crate::push::{reply_channel, Push, ReplyFuture};
use crate::socket::Socket;
use crate::timer::RetryTimer;
use crate::transformer::{PostgresTransformer, RecordTransformer};

/// Maximum topic length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Validate a topic name.
///
/// # Errors
///
/// Returns [`ChannelError::InvalidTopic`] if the topic is empty, too long
/// or contains non-printable characters.
pub fn validate_topic(topic: &str) -> Result<(), ChannelError> {
    if topic.is_empty() {
        return Err(ChannelError::InvalidTopic("Topic cannot be empty"));
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(ChannelError::InvalidTopic("Topic too long"));
    }
    if !topic.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err(ChannelError::InvalidTopic("Topic contains invalid characters"));
    }
    Ok(())
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Closed,
    Errored,
    Joined,
    Joining,
    Leaving,
}

impl ChannelState {
    /// Get the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelState::Closed => "closed",
            ChannelState::Errored => "errored",
            ChannelState::Joined => "joined",
            ChannelState::Joining => "joining",
            ChannelState::Leaving => "leaving",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported to the subscribe callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    TimedOut,
    Closed,
    ChannelError,
}

impl SubscribeStatus {
    /// Get the status name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SubscribeStatus::Subscribed => "SUBSCRIBED",
            SubscribeStatus::TimedOut => "TIMED_OUT",
            SubscribeStatus::Closed => "CLOSED",
            SubscribeStatus::ChannelError => "CHANNEL_ERROR",
        }
    }
}

impl fmt::Display for SubscribeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`Channel::send`] and [`Channel::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    TimedOut,
    Error,
    RateLimited,
}

impl SendStatus {
    /// Get the status name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            SendStatus::Ok => "ok",
            SendStatus::TimedOut => "timed out",
            SendStatus::Error => "error",
            SendStatus::RateLimited => "rate limited",
        }
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Broadcast,
    Presence,
    PostgresChanges,
}

impl MessageKind {
    /// Get the wire name, also used as the push event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageKind::Broadcast => "broadcast",
            MessageKind::Presence => "presence",
            MessageKind::PostgresChanges => "postgres_changes",
        }
    }
}

/// A message sent with [`Channel::send`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub kind: MessageKind,
    pub event: String,
    pub payload: Option<Value>,
}

impl OutboundMessage {
    /// Create a broadcast message.
    #[must_use]
    pub fn broadcast(event: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MessageKind::Broadcast,
            event: event.into(),
            payload: Some(payload),
        }
    }

    /// Create a presence message.
    #[must_use]
    pub fn presence(event: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: MessageKind::Presence,
            event: event.into(),
            payload,
        }
    }

    /// Wire payload: `{type, event, payload?}`.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        let mut body = json!({
            "type": self.kind.as_str(),
            "event": self.event,
        });
        if let Some(payload) = &self.payload {
            body["payload"] = payload.clone();
        }
        body
    }
}

/// Callback receiving subscription status changes.
pub type SubscribeCallback = Arc<dyn Fn(SubscribeStatus, Option<ChannelError>) + Send + Sync>;

/// Hook run on every inbound payload before dispatch.
///
/// Must return the payload, modified or unmodified.
pub type MessageHook = Arc<dyn Fn(&EventType, Value, Option<&str>) -> Option<Value> + Send + Sync>;

pub(crate) struct ChannelInner {
    topic: String,
    socket: Arc<dyn Socket>,
    options: ChannelOptions,
    transformer: Arc<dyn RecordTransformer>,
    reaction: ReentrantMutex<()>,
    core: Mutex<ChannelCore>,
    presence: Mutex<Presence>,
    join_push: Push,
    rejoin_timer: RetryTimer,
}

struct ChannelCore {
    state: ChannelState,
    joined_once: bool,
    push_buffer: Vec<Push>,
    bindings: Bindings,
    pending_replies: HashMap<String, Push>,
    message_hook: Option<MessageHook>,
}

impl ChannelInner {
    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn socket(&self) -> &dyn Socket {
        &*self.socket
    }

    /// Reference of the current join attempt.
    pub(crate) fn join_ref(&self) -> Option<String> {
        self.join_push.reference()
    }

    pub(crate) fn register_reply(&self, reference: String, push: Push) {
        self.core.lock().pending_replies.insert(reference, push);
    }

    pub(crate) fn unregister_reply(&self, reference: &str) {
        self.core.lock().pending_replies.remove(reference);
    }

    /// Run `f` as one reaction of this channel.
    pub(crate) fn react<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.reaction.lock();
        f()
    }
}

/// Client-side handle to one topic of a shared socket.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel using the default record transformer.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid.
    pub fn new(
        topic: impl Into<String>,
        socket: Arc<dyn Socket>,
        options: ChannelOptions,
    ) -> Result<Self, ChannelError> {
        Self::with_transformer(topic, socket, options, Arc::new(PostgresTransformer::new()))
    }

    /// Create a channel converting postgres records with `transformer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid.
    pub fn with_transformer(
        topic: impl Into<String>,
        socket: Arc<dyn Socket>,
        options: ChannelOptions,
        transformer: Arc<dyn RecordTransformer>,
    ) -> Result<Self, ChannelError> {
        let topic = topic.into();
        validate_topic(&topic)?;

        let join_payload = json!({ "config": join_config(&options, &[]) });
        let timeout = options.timeout();

        let inner = Arc::new_cyclic(|weak: &Weak<ChannelInner>| {
            let on_fire = weak.clone();
            let backoff_target = weak.clone();

            ChannelInner {
                join_push: Push::new(weak.clone(), ChannelEvent::Join.as_str(), join_payload, timeout),
                rejoin_timer: RetryTimer::new(
                    Arc::new(move || {
                        if let Some(channel) = Channel::upgrade(&on_fire) {
                            channel.react(|| channel.rejoin_until_connected());
                        }
                    }),
                    Arc::new(move |tries: u32| match backoff_target.upgrade() {
                        Some(inner) => inner.socket.reconnect_after(tries),
                        None => crate::options::default_reconnect_after(tries),
                    }),
                ),
                topic,
                socket,
                options,
                transformer,
                reaction: ReentrantMutex::new(()),
                core: Mutex::new(ChannelCore {
                    state: ChannelState::Closed,
                    joined_once: false,
                    push_buffer: Vec::new(),
                    bindings: Bindings::new(),
                    pending_replies: HashMap::new(),
                    message_hook: None,
                }),
                presence: Mutex::new(Presence::new()),
            }
        });

        let channel = Channel { inner };
        channel.install_handlers();
        debug!(topic = %channel.topic(), "Channel created");
        Ok(channel)
    }

    fn upgrade(weak: &Weak<ChannelInner>) -> Option<Channel> {
        weak.upgrade().map(|inner| Channel { inner })
    }

    fn react<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.react(f)
    }

    fn install_handlers(&self) {
        let weak = Arc::downgrade(&self.inner);

        let on_ok = weak.clone();
        let on_error = weak.clone();
        let on_timeout = weak.clone();
        self.inner
            .join_push
            .receive(ReplyStatus::Ok, move |_: &Value| {
                if let Some(channel) = Channel::upgrade(&on_ok) {
                    channel.on_join_ok();
                }
            })
            .receive(ReplyStatus::Error, move |response: &Value| {
                if let Some(channel) = Channel::upgrade(&on_error) {
                    channel.on_join_error(response);
                }
            })
            .receive(ReplyStatus::Timeout, move |_: &Value| {
                if let Some(channel) = Channel::upgrade(&on_timeout) {
                    channel.on_join_timeout();
                }
            });

        self.bind_internal(EventType::Close, |channel, _| channel.on_close());
        self.bind_internal(EventType::Error, |channel, payload| channel.on_error(payload));
        self.bind_internal(EventType::PresenceState, |channel, payload| {
            channel.on_presence_state(payload);
        });
        self.bind_internal(EventType::PresenceDiff, |channel, payload| {
            channel.on_presence_diff(payload);
        });
    }

    fn bind_internal<F>(&self, event_type: EventType, handler: F)
    where
        F: Fn(&Channel, &Value) + Send + Sync + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let callback: Callback = Arc::new(move |payload: &Value, _: Option<&str>| {
            if let Some(channel) = Channel::upgrade(&weak) {
                handler(&channel, payload);
            }
        });
        self.inner
            .core
            .lock()
            .bindings
            .add(BindingFilter::Event(event_type, Map::new()), callback);
    }

    // ---- Introspection ----

    /// Get the topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Get the options.
    #[must_use]
    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    /// Get the lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.inner.core.lock().state
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.state() == ChannelState::Errored
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    #[must_use]
    pub fn is_joining(&self) -> bool {
        self.state() == ChannelState::Joining
    }

    #[must_use]
    pub fn is_leaving(&self) -> bool {
        self.state() == ChannelState::Leaving
    }

    /// Reference of the current join attempt.
    #[must_use]
    pub fn join_ref(&self) -> Option<String> {
        self.inner.join_ref()
    }

    /// Number of pushes waiting for the channel to join.
    #[must_use]
    pub fn buffered_pushes(&self) -> usize {
        self.inner.core.lock().push_buffer.len()
    }

    /// Declared postgres-changes filters with their server ids.
    #[must_use]
    pub fn postgres_bindings(&self) -> Vec<(PostgresChangesFilter, Option<u64>)> {
        self.inner
            .core
            .lock()
            .bindings
            .postgres_bindings()
            .iter()
            .map(|b| (b.filter.clone(), b.id))
            .collect()
    }

    /// Snapshot of the presence state.
    #[must_use]
    pub fn presence_state(&self) -> PresenceMap {
        self.inner.presence.lock().state().clone()
    }

    /// Check if pushes can be sent right now.
    #[must_use]
    pub fn can_push(&self) -> bool {
        self.inner.socket.is_connected() && self.is_joined()
    }

    /// Check if an inbound frame belongs to this channel.
    ///
    /// Lifecycle events scoped to another join attempt are rejected.
    #[must_use]
    pub fn is_member(&self, topic: &str, event: &str, join_ref: Option<&str>) -> bool {
        if topic != self.inner.topic {
            return false;
        }

        if let Some(join_ref) = join_ref {
            let current = self.join_ref();
            if EventType::parse(event).is_lifecycle() && current.as_deref() != Some(join_ref) {
                self.log(
                    &format!("dropping outdated message {event} for join_ref {join_ref}"),
                    None,
                );
                return false;
            }
        }
        true
    }

    fn set_state(&self, state: ChannelState) {
        let previous = std::mem::replace(&mut self.inner.core.lock().state, state);
        if previous != state {
            trace!(topic = %self.inner.topic, from = %previous, to = %state, "Channel state changed");
        }
    }

    fn log(&self, message: &str, data: Option<&Value>) {
        if self.inner.socket.has_logger() {
            self.inner.socket.log("channel", message, data);
        }
    }

    // ---- Bindings ----

    /// Register a binding.
    pub fn on<F>(&self, filter: BindingFilter, callback: F) -> &Self
    where
        F: Fn(&Value, Option<&str>) + Send + Sync + 'static,
    {
        self.inner.core.lock().bindings.add(filter, Arc::new(callback));
        self
    }

    /// Listen to broadcasts with the given event, `*` for all.
    pub fn on_broadcast<F>(&self, event: &str, callback: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on(BindingFilter::Broadcast(EventFilter::new(event)), move |p, _| {
            callback(p);
        })
    }

    /// Listen to presence `join`, `leave` or `sync` events, `*` for all.
    pub fn on_presence<F>(&self, event: &str, callback: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on(BindingFilter::Presence(EventFilter::new(event)), move |p, _| {
            callback(p);
        })
    }

    /// Listen to postgres row changes.
    ///
    /// Must be called before [`Channel::subscribe`] for the filter to be
    /// sent to the server.
    pub fn on_postgres_changes<F>(&self, filter: PostgresChangesFilter, callback: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.on(BindingFilter::PostgresChanges(filter), move |p, _| {
            callback(p);
        })
    }

    /// Listen to any event type with an object filter.
    pub fn on_event<F>(
        &self,
        event_type: impl Into<EventType>,
        filter: Map<String, Value>,
        callback: F,
    ) -> &Self
    where
        F: Fn(&Value, Option<&str>) + Send + Sync + 'static,
    {
        self.on(BindingFilter::from_parts(event_type, filter), callback)
    }

    /// Remove bindings with an equal filter. Returns how many were removed.
    pub fn off(&self, filter: &BindingFilter) -> usize {
        self.inner.core.lock().bindings.remove(filter)
    }

    /// Install the pre-dispatch hook.
    pub fn set_message_hook<F>(&self, hook: F)
    where
        F: Fn(&EventType, Value, Option<&str>) -> Option<Value> + Send + Sync + 'static,
    {
        self.inner.core.lock().message_hook = Some(Arc::new(hook));
    }

    // ---- Lifecycle ----

    /// Join the topic with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AlreadySubscribed`] if called twice.
    pub fn subscribe<F>(&self, callback: F) -> Result<(), ChannelError>
    where
        F: Fn(SubscribeStatus, Option<ChannelError>) + Send + Sync + 'static,
    {
        self.subscribe_with_timeout(callback, self.inner.options.timeout())
    }

    /// Join the topic.
    ///
    /// `callback` receives every status change of the subscription: the
    /// join outcome as well as later errors and the final close.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::AlreadySubscribed`] if called twice.
    pub fn subscribe_with_timeout<F>(&self, callback: F, timeout: Duration) -> Result<(), ChannelError>
    where
        F: Fn(SubscribeStatus, Option<ChannelError>) + Send + Sync + 'static,
    {
        let callback: SubscribeCallback = Arc::new(callback);

        self.react(|| {
            let postgres_filters = {
                let mut core = self.inner.core.lock();
                if core.joined_once {
                    return Err(ChannelError::AlreadySubscribed(self.inner.topic.clone()));
                }
                core.joined_once = true;

                let on_error = Arc::clone(&callback);
                core.bindings.add(
                    BindingFilter::Event(EventType::Error, Map::new()),
                    Arc::new(move |payload: &Value, _: Option<&str>| {
                        on_error(
                            SubscribeStatus::ChannelError,
                            Some(ChannelError::from_response(payload)),
                        );
                    }),
                );
                let on_close = Arc::clone(&callback);
                core.bindings.add(
                    BindingFilter::Event(EventType::Close, Map::new()),
                    Arc::new(move |_: &Value, _: Option<&str>| {
                        on_close(SubscribeStatus::Closed, None);
                    }),
                );

                core.bindings.postgres_filters()
            };

            let mut partial = Map::new();
            partial.insert(
                "config".to_string(),
                join_config(&self.inner.options, &postgres_filters),
            );
            if let Some(token) = self.inner.socket.access_token() {
                partial.insert("access_token".to_string(), Value::String(token));
            }
            self.inner.join_push.update_payload(partial);

            let weak = Arc::downgrade(&self.inner);
            let on_ok = Arc::clone(&callback);
            let on_error = Arc::clone(&callback);
            let on_timeout = Arc::clone(&callback);
            self.inner
                .join_push
                .receive(ReplyStatus::Ok, move |response: &Value| {
                    if let Some(channel) = Channel::upgrade(&weak) {
                        channel.on_subscribe_ok(&on_ok, response);
                    }
                })
                .receive(ReplyStatus::Error, move |response: &Value| {
                    on_error(
                        SubscribeStatus::ChannelError,
                        Some(ChannelError::from_response(response)),
                    );
                })
                .receive(ReplyStatus::Timeout, move |_: &Value| {
                    on_timeout(SubscribeStatus::TimedOut, None);
                });

            self.rejoin(timeout);
            Ok(())
        })
    }

    fn on_subscribe_ok(&self, callback: &SubscribeCallback, response: &Value) {
        if !self.is_joined() {
            return;
        }

        if let Some(token) = self.inner.socket.access_token() {
            self.inner.socket.set_auth(Some(token));
        }

        let Some(confirmed) = response.get("postgres_changes") else {
            callback(SubscribeStatus::Subscribed, None);
            return;
        };

        let server: Result<Vec<ServerPostgresFilter>, _> = match confirmed {
            Value::Null => Ok(Vec::new()),
            other => serde_json::from_value(other.clone()),
        };
        let result = match server {
            Ok(server) => self.inner.core.lock().bindings.reconcile_postgres(&server),
            Err(e) => {
                warn!(topic = %self.inner.topic, "Malformed postgres_changes confirmation: {}", e);
                Err(ChannelError::PostgresMismatch)
            }
        };

        match result {
            Ok(()) => callback(SubscribeStatus::Subscribed, None),
            Err(e) => {
                let _ = self.unsubscribe();
                callback(SubscribeStatus::ChannelError, Some(e));
            }
        }
    }

    fn on_join_ok(&self) {
        if !self.is_joining() {
            debug!(topic = %self.inner.topic, "Ignoring join reply outside of joining state");
            return;
        }
        self.set_state(ChannelState::Joined);
        self.inner.rejoin_timer.reset();

        let buffered = std::mem::take(&mut self.inner.core.lock().push_buffer);
        for push in buffered {
            push.send();
        }
    }

    fn on_join_error(&self, response: &Value) {
        if !self.is_joining() {
            return;
        }
        self.log(&format!("join error {}", self.inner.topic), Some(response));
        self.set_state(ChannelState::Errored);
        self.schedule_rejoin();
    }

    fn on_join_timeout(&self) {
        if !self.is_joining() {
            return;
        }
        let timeout_ms =
            u64::try_from(self.inner.join_push.timeout().as_millis()).unwrap_or(u64::MAX);
        self.log(&format!("timeout {}", self.inner.topic), Some(&json!(timeout_ms)));
        self.set_state(ChannelState::Errored);
        self.schedule_rejoin();
    }

    fn on_close(&self) {
        self.inner.rejoin_timer.reset();
        let join_ref = self.join_ref().unwrap_or_default();
        self.log(&format!("close {} {}", self.inner.topic, join_ref), None);
        self.set_state(ChannelState::Closed);
        self.inner.socket.remove(&self.inner.topic);
    }

    fn on_error(&self, reason: &Value) {
        if matches!(self.state(), ChannelState::Leaving | ChannelState::Closed) {
            return;
        }
        self.log(&format!("error {}", self.inner.topic), Some(reason));
        self.set_state(ChannelState::Errored);
        self.schedule_rejoin();
    }

    fn schedule_rejoin(&self) {
        let delay = self.inner.rejoin_timer.schedule_timeout();
        metrics::record_rejoin_scheduled();
        debug!(
            topic = %self.inner.topic,
            tries = self.inner.rejoin_timer.tries(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Rejoin scheduled"
        );
    }

    fn rejoin(&self, timeout: Duration) {
        if self.is_leaving() {
            return;
        }
        self.inner.socket.leave_open_topic(&self.inner.topic);
        self.set_state(ChannelState::Joining);
        metrics::record_join_attempt();
        self.inner.join_push.resend(timeout);
    }

    fn rejoin_until_connected(&self) {
        self.schedule_rejoin();
        if self.inner.socket.is_connected() {
            self.rejoin(self.inner.options.timeout());
        }
    }

    /// Leave the topic with the default timeout.
    pub fn unsubscribe(&self) -> ReplyFuture<SendStatus> {
        self.unsubscribe_with_timeout(self.inner.options.timeout())
    }

    /// Leave the topic.
    ///
    /// Resolves to [`SendStatus::Ok`] once the server confirmed the leave,
    /// or [`SendStatus::TimedOut`] if it did not answer in time. In both
    /// cases the channel closes. When the channel cannot push, it closes
    /// immediately without sending anything. Leaving a closed channel
    /// resolves to [`SendStatus::Ok`] and does nothing else.
    pub fn unsubscribe_with_timeout(&self, timeout: Duration) -> ReplyFuture<SendStatus> {
        let (resolver, future) = reply_channel();

        self.react(|| {
            if self.is_closed() {
                resolver.resolve(SendStatus::Ok);
                return;
            }
            let can_push = self.can_push();
            self.set_state(ChannelState::Leaving);
            self.inner.rejoin_timer.reset();
            self.inner.join_push.destroy();

            let leave = Push::new(
                Arc::downgrade(&self.inner),
                ChannelEvent::Leave.as_str(),
                json!({}),
                timeout,
            );

            let on_ok = (Arc::downgrade(&self.inner), resolver.clone());
            let on_timeout = (Arc::downgrade(&self.inner), resolver.clone());
            leave
                .receive(ReplyStatus::Ok, move |_: &Value| {
                    if let Some(channel) = Channel::upgrade(&on_ok.0) {
                        channel.close_after_leave();
                    }
                    on_ok.1.resolve(SendStatus::Ok);
                })
                .receive(ReplyStatus::Timeout, move |_: &Value| {
                    if let Some(channel) = Channel::upgrade(&on_timeout.0) {
                        channel.close_after_leave();
                    }
                    on_timeout.1.resolve(SendStatus::TimedOut);
                })
                .receive(ReplyStatus::Error, move |_: &Value| {
                    resolver.resolve(SendStatus::Error);
                });

            if can_push {
                leave.send();
            } else {
                leave.trigger(ReplyStatus::Ok, json!({}));
            }
        });

        future
    }

    fn close_after_leave(&self) {
        self.log(&format!("leave {}", self.inner.topic), None);
        let join_ref = self.join_ref();
        if let Err(e) = self.trigger(
            EventType::Close,
            Value::String("leave".to_string()),
            join_ref.as_deref(),
        ) {
            warn!(topic = %self.inner.topic, "Close after leave failed: {}", e);
        }
    }

    /// Destroy every pending push and stop rejoining.
    ///
    /// The channel is closed and all bindings are dropped. Used by the
    /// socket when it discards the channel.
    pub fn teardown(&self) {
        self.react(|| {
            let (buffered, pending) = {
                let mut core = self.inner.core.lock();
                core.state = ChannelState::Closed;
                core.bindings = Bindings::new();
                (
                    std::mem::take(&mut core.push_buffer),
                    std::mem::take(&mut core.pending_replies),
                )
            };

            for push in buffered.iter().chain(pending.values()) {
                push.destroy();
            }
            self.inner.rejoin_timer.reset();
            self.inner.join_push.destroy();
            debug!(topic = %self.inner.topic, "Channel torn down");
        });
    }

    /// Shallow-merge `partial` into the join payload.
    pub fn update_join_payload(&self, partial: Map<String, Value>) {
        self.inner.join_push.update_payload(partial);
    }

    /// Store a new access token in the join payload.
    ///
    /// A joined channel also pushes the token to the server.
    pub fn set_access_token(&self, token: Option<String>) {
        self.react(|| {
            let mut partial = Map::new();
            partial.insert(
                "access_token".to_string(),
                token.clone().map_or(Value::Null, Value::String),
            );
            self.update_join_payload(partial);

            let Some(token) = token else {
                return;
            };
            if self.is_joined() {
                let payload = json!({ "access_token": token });
                if let Err(e) = self.push(
                    ChannelEvent::AccessToken.as_str(),
                    payload,
                    self.inner.options.timeout(),
                ) {
                    warn!(topic = %self.inner.topic, "Failed to push access token: {}", e);
                }
            }
        });
    }

    // ---- Outbound ----

    /// Push an event to the topic.
    ///
    /// Sent immediately when the channel can push; otherwise buffered
    /// until the next successful join, with its timeout already running.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PushBeforeJoin`] if the channel was never
    /// subscribed.
    pub fn push(&self, event: &str, payload: Value, timeout: Duration) -> Result<Push, ChannelError> {
        self.push_with(event, payload, timeout, true)
    }

    fn push_with(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
        acknowledged: bool,
    ) -> Result<Push, ChannelError> {
        self.react(|| {
            if !self.inner.core.lock().joined_once {
                return Err(ChannelError::PushBeforeJoin {
                    topic: self.inner.topic.clone(),
                    event: event.to_string(),
                });
            }

            let weak = Arc::downgrade(&self.inner);
            let push = if acknowledged {
                Push::new(weak, event, payload, timeout)
            } else {
                Push::unacknowledged(weak, event, payload, timeout)
            };
            if self.can_push() {
                push.send();
            } else {
                push.start_timeout();
                self.inner.core.lock().push_buffer.push(push.clone());
            }
            Ok(push)
        })
    }

    /// Send a message with the default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PushBeforeJoin`] if the channel was never
    /// subscribed.
    pub fn send(&self, message: OutboundMessage) -> Result<ReplyFuture<SendStatus>, ChannelError> {
        self.send_with_timeout(message, self.inner.options.timeout())
    }

    /// Send a message.
    ///
    /// Broadcasts resolve to [`SendStatus::Ok`] right away unless the
    /// channel was configured with `broadcast.ack`. A push refused by the
    /// rate limiter resolves to [`SendStatus::RateLimited`].
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PushBeforeJoin`] if the channel was never
    /// subscribed.
    pub fn send_with_timeout(
        &self,
        message: OutboundMessage,
        timeout: Duration,
    ) -> Result<ReplyFuture<SendStatus>, ChannelError> {
        let (resolver, future) = reply_channel();
        let skip_ack = message.kind == MessageKind::Broadcast && !self.inner.options.broadcast.ack;

        self.react(|| -> Result<(), ChannelError> {
            let push =
                self.push_with(message.kind.as_str(), message.to_payload(), timeout, !skip_ack)?;

            if push.is_rate_limited() {
                resolver.resolve(SendStatus::RateLimited);
                return Ok(());
            }
            if skip_ack {
                resolver.resolve(SendStatus::Ok);
                return Ok(());
            }

            let on_ok = resolver.clone();
            let on_error = resolver.clone();
            push.receive(ReplyStatus::Ok, move |_: &Value| {
                on_ok.resolve(SendStatus::Ok);
            })
            .receive(ReplyStatus::Error, move |_: &Value| {
                on_error.resolve(SendStatus::Error);
            })
            .receive(ReplyStatus::Timeout, move |_: &Value| {
                resolver.resolve(SendStatus::TimedOut);
            });
            Ok(())
        })?;

        Ok(future)
    }

    /// Track this client's presence with `payload` as its meta.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PushBeforeJoin`] if the channel was never
    /// subscribed.
    pub fn track(&self, payload: Value) -> Result<ReplyFuture<SendStatus>, ChannelError> {
        self.send(OutboundMessage::presence("track", Some(payload)))
    }

    /// Stop tracking this client's presence.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PushBeforeJoin`] if the channel was never
    /// subscribed.
    pub fn untrack(&self) -> Result<ReplyFuture<SendStatus>, ChannelError> {
        self.send(OutboundMessage::presence("untrack", None))
    }

    // ---- Inbound ----

    /// Route an inbound frame to this channel.
    ///
    /// Frames for other topics or stale join attempts are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PayloadDropped`] if the message hook
    /// dropped the payload.
    pub fn handle_frame(&self, frame: Frame) -> Result<(), ChannelError> {
        if !self.is_member(&frame.topic, &frame.event, frame.join_ref.as_deref()) {
            return Ok(());
        }
        self.trigger(frame.event.as_str(), frame.payload, frame.reference.as_deref())
    }

    /// Dispatch an event to the matching bindings.
    ///
    /// Lifecycle events carrying a reference other than the current join
    /// reference are ignored. Replies are also routed to the push they
    /// answer.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PayloadDropped`] if the message hook
    /// dropped a non-null payload.
    pub fn trigger(
        &self,
        event: impl Into<EventType>,
        payload: Value,
        reference: Option<&str>,
    ) -> Result<(), ChannelError> {
        let event_type = event.into();
        self.react(|| self.dispatch(&event_type, payload, reference))
    }

    fn dispatch(
        &self,
        event_type: &EventType,
        payload: Value,
        reference: Option<&str>,
    ) -> Result<(), ChannelError> {
        if let Some(reference) = reference {
            if event_type.is_lifecycle() && self.join_ref().as_deref() != Some(reference) {
                trace!(topic = %self.inner.topic, event = %event_type, "Ignoring stale lifecycle event");
                return Ok(());
            }
        }

        let hook = self.inner.core.lock().message_hook.clone();
        let payload = match hook {
            Some(hook) => {
                let was_null = payload.is_null();
                match hook(event_type, payload, reference) {
                    Some(payload) => payload,
                    None if was_null => {
                        trace!(topic = %self.inner.topic, event = %event_type, "Hook dropped empty payload");
                        return Ok(());
                    }
                    None => return Err(ChannelError::PayloadDropped(event_type.to_string())),
                }
            }
            None => payload,
        };

        if *event_type == EventType::Reply {
            if let Some(reference) = reference {
                self.route_reply(reference, &payload);
            }
        }

        let callbacks = self.inner.core.lock().bindings.matching(event_type, &payload);
        if callbacks.is_empty() {
            return Ok(());
        }

        let payload = if event_type.is_row_change() {
            payload
        } else {
            enrich_postgres_payload(&payload, self.inner.transformer.as_ref()).unwrap_or(payload)
        };

        metrics::record_dispatch(event_type.as_str(), callbacks.len());
        for callback in callbacks {
            callback(&payload, reference);
        }
        Ok(())
    }

    fn route_reply(&self, reference: &str, payload: &Value) {
        let Some(push) = self.inner.core.lock().pending_replies.remove(reference) else {
            trace!(topic = %self.inner.topic, reference, "Reply for unknown push");
            return;
        };

        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .map_or(ReplyStatus::Error, ReplyStatus::from);
        let response = payload.get("response").cloned().unwrap_or(Value::Null);
        push.trigger(status, response);
    }

    fn on_presence_state(&self, payload: &Value) {
        let join_ref = self.join_ref();
        let changes = self.inner.presence.lock().sync_state(join_ref, payload);
        self.emit_presence(changes);
    }

    fn on_presence_diff(&self, payload: &Value) {
        let join_ref = self.join_ref();
        let changes = self
            .inner
            .presence
            .lock()
            .sync_diff(join_ref.as_deref(), payload);
        if let Some(changes) = changes {
            self.emit_presence(changes);
        }
    }

    fn emit_presence(&self, changes: Vec<PresenceChange>) {
        let payloads = changes
            .iter()
            .map(PresenceChange::to_payload)
            .chain(std::iter::once(json!({ "event": "sync" })));

        for payload in payloads {
            if let Err(e) = self.dispatch(&EventType::Presence, payload, None) {
                warn!(topic = %self.inner.topic, "Presence dispatch failed: {}", e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_replies(&self) -> usize {
        self.inner.core.lock().pending_replies.len()
    }

    #[cfg(test)]
    pub(crate) fn is_buffered(&self, push: &Push) -> bool {
        self.inner
            .core
            .lock()
            .push_buffer
            .iter()
            .any(|p| p.ptr_eq(push))
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Channel")
            .field("topic", &self.inner.topic)
            .field("state", &core.state)
            .field("joined_once", &core.joined_once)
            .field("buffered", &core.push_buffer.len())
            .field("bindings", &core.bindings.len())
            .finish()
    }
}

/// Join configuration sent in the `phx_join` payload.
fn join_config(options: &ChannelOptions, postgres_changes: &[PostgresChangesFilter]) -> Value {
    json!({
        "broadcast": {
            "ack": options.broadcast.ack,
            "self": options.broadcast.echo_self,
        },
        "presence": {
            "key": options.presence.key,
        },
        "postgres_changes": postgres_changes,
        "private": options.private,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::PostgresEvent;
    use crate::push::LATE_REPLY_WINDOW;
    use crate::testing::MockSocket;

    const TOPIC: &str = "realtime:room";
    const TIMEOUT: Duration = Duration::from_millis(500);

    type Statuses = Arc<Mutex<Vec<(SubscribeStatus, Option<ChannelError>)>>>;

    fn options() -> ChannelOptions {
        ChannelOptions::default().with_timeout(TIMEOUT)
    }

    fn channel_on(socket: &Arc<MockSocket>, options: ChannelOptions) -> Channel {
        let socket: Arc<dyn Socket> = socket.clone();
        Channel::new(TOPIC, socket, options).unwrap()
    }

    fn subscribe(channel: &Channel) -> Statuses {
        let statuses: Statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        channel
            .subscribe(move |status, error| sink.lock().push((status, error)))
            .unwrap();
        statuses
    }

    fn reply(channel: &Channel, frame: &Frame, status: &str, response: Value) {
        let reference = frame.reference.clone().unwrap();
        channel
            .handle_frame(Frame::reply(TOPIC, reference, status, response))
            .unwrap();
    }

    fn joined(options: ChannelOptions) -> (Channel, Arc<MockSocket>, Statuses) {
        let socket = MockSocket::connected();
        let channel = channel_on(&socket, options);
        let statuses = subscribe(&channel);
        let join = socket.last_sent("phx_join").unwrap();
        reply(&channel, &join, "ok", json!({}));
        assert!(channel.is_joined());
        (channel, socket, statuses)
    }

    fn collect_payloads() -> (Arc<Mutex<Vec<Value>>>, impl Fn(&Value) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |payload: &Value| sink.lock().push(payload.clone()))
    }

    #[test]
    fn test_topic_validation() {
        assert!(validate_topic("realtime:room").is_ok());
        assert!(validate_topic("").is_err());
        assert!(validate_topic(&"a".repeat(MAX_TOPIC_LENGTH + 1)).is_err());
        assert!(validate_topic("bad\ntopic").is_err());

        let socket: Arc<dyn Socket> = MockSocket::connected();
        assert!(matches!(
            Channel::new("", socket, ChannelOptions::default()),
            Err(ChannelError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_outbound_message_payload() {
        assert_eq!(
            OutboundMessage::broadcast("cursor", json!({"x": 1})).to_payload(),
            json!({"type": "broadcast", "event": "cursor", "payload": {"x": 1}})
        );
        assert_eq!(
            OutboundMessage::presence("untrack", None).to_payload(),
            json!({"type": "presence", "event": "untrack"})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_sends_join() {
        let socket = MockSocket::connected();
        let channel = channel_on(&socket, options().with_broadcast_ack(true).with_presence_key("me"));
        subscribe(&channel);

        assert!(channel.is_joining());
        assert_eq!(socket.left_topics(), vec![TOPIC.to_string()]);

        let join = socket.last_sent("phx_join").unwrap();
        assert_eq!(join.topic, TOPIC);
        assert_eq!(join.reference, join.join_ref);
        assert_eq!(channel.join_ref(), join.reference);
        assert_eq!(
            join.payload["config"],
            json!({
                "broadcast": {"ack": true, "self": false},
                "presence": {"key": "me"},
                "postgres_changes": [],
                "private": false
            })
        );
        assert!(join.payload.get("access_token").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_twice_fails() {
        let (channel, _, _) = joined(options());
        assert_eq!(
            channel.subscribe(|_, _| {}),
            Err(ChannelError::AlreadySubscribed(TOPIC.to_string()))
        );
        assert!(channel.subscribe(|_, _| {}).unwrap_err().is_misuse());
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffered_pushes_flush_in_order() {
        let socket = MockSocket::connected();
        let channel = channel_on(&socket, options());
        let statuses = subscribe(&channel);

        let pushes: Vec<Push> = (0..3)
            .map(|n| channel.push("note", json!({"n": n}), TIMEOUT).unwrap())
            .collect();
        assert_eq!(channel.buffered_pushes(), 3);
        assert!(pushes.iter().all(|p| channel.is_buffered(p) && !p.is_sent()));
        assert!(socket.sent_events("note").is_empty());

        let join = socket.last_sent("phx_join").unwrap();
        reply(&channel, &join, "ok", json!({}));

        assert!(channel.is_joined());
        assert_eq!(channel.buffered_pushes(), 0);
        let order: Vec<Value> = socket
            .sent_events("note")
            .iter()
            .map(|f| f.payload["n"].clone())
            .collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2)]);
        assert!(socket
            .sent_events("note")
            .iter()
            .all(|f| f.join_ref == join.reference));
        assert_eq!(statuses.lock()[0].0, SubscribeStatus::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout_schedules_rejoin() {
        let socket = MockSocket::connected();
        let channel = channel_on(&socket, options());
        let statuses = subscribe(&channel);

        tokio::time::sleep(TIMEOUT + Duration::from_millis(1)).await;
        assert!(channel.is_errored());
        assert_eq!(statuses.lock()[0], (SubscribeStatus::TimedOut, None));
        assert!(channel.inner.rejoin_timer.is_pending());
        assert_eq!(channel.inner.rejoin_timer.tries(), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(channel.is_joining());
        let joins = socket.sent_events("phx_join");
        assert_eq!(joins.len(), 2);
        assert_ne!(joins[0].reference, joins[1].reference);

        reply(&channel, &joins[1], "ok", json!({}));
        assert!(channel.is_joined());
        assert_eq!(channel.inner.rejoin_timer.tries(), 0);
        assert!(!channel.inner.rejoin_timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_join_timeout_ignored() {
        let (channel, _, _) = joined(options());
        channel.inner.join_push.trigger(ReplyStatus::Timeout, json!({}));
        assert!(channel.is_joined());
        assert!(!channel.inner.rejoin_timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_join_reply_after_timeout() {
        let socket = MockSocket::connected();
        let channel = channel_on(&socket, options());
        let statuses = subscribe(&channel);
        let join = socket.last_sent("phx_join").unwrap();

        tokio::time::sleep(TIMEOUT + Duration::from_millis(1)).await;
        assert!(channel.is_errored());

        reply(&channel, &join, "ok", json!({}));
        assert!(channel.is_errored());
        assert_eq!(statuses.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_error_reported() {
        let socket = MockSocket::connected();
        let channel = channel_on(&socket, options());
        let statuses = subscribe(&channel);
        let join = socket.last_sent("phx_join").unwrap();

        reply(&channel, &join, "error", json!({"reason": "unauthorized"}));
        assert_eq!(
            statuses.lock()[0],
            (
                SubscribeStatus::ChannelError,
                Some(ChannelError::Server("unauthorized".into()))
            )
        );
        assert!(channel.is_errored());
        assert!(channel.inner.rejoin_timer.is_pending());
        assert_eq!(channel.inner.rejoin_timer.tries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_error_rejoins() {
        let socket = MockSocket::connected();
        let channel = channel_on(&socket, options());
        let statuses = subscribe(&channel);
        let join = socket.last_sent("phx_join").unwrap();
        reply(&channel, &join, "error", json!({"reason": "unauthorized"}));

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(channel.is_joining());
        let joins = socket.sent_events("phx_join");
        assert_eq!(joins.len(), 2);
        assert_ne!(joins[0].reference, joins[1].reference);

        reply(&channel, &joins[1], "ok", json!({}));
        assert!(channel.is_joined());
        assert_eq!(statuses.lock().last().unwrap().0, SubscribeStatus::Subscribed);
        assert!(!channel.inner.rejoin_timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_join_error_ignored() {
        let (channel, socket, _) = joined(options());
        channel
            .inner
            .join_push
            .trigger(ReplyStatus::Error, json!({"reason": "late"}));
        assert!(channel.is_joined());
        assert!(!channel.inner.rejoin_timer.is_pending());
        assert_eq!(socket.sent_events("phx_join").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_postgres_reconciliation() {
        let socket = MockSocket::connected();
        let channel = channel_on(&socket, options());
        channel.on_postgres_changes(
            PostgresChangesFilter::new(PostgresEvent::Insert, "public").table("t"),
            |_| {},
        );
        let statuses = subscribe(&channel);

        let join = socket.last_sent("phx_join").unwrap();
        assert_eq!(
            join.payload["config"]["postgres_changes"],
            json!([{"event": "INSERT", "schema": "public", "table": "t"}])
        );

        reply(
            &channel,
            &join,
            "ok",
            json!({"postgres_changes": [
                {"event": "INSERT", "schema": "public", "table": "t", "filter": "", "id": 7}
            ]}),
        );

        assert_eq!(statuses.lock()[0], (SubscribeStatus::Subscribed, None));
        assert_eq!(channel.postgres_bindings()[0].1, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_postgres_mismatch_unsubscribes() {
        let socket = MockSocket::connected();
        let channel = channel_on(&socket, options());
        channel.on_postgres_changes(
            PostgresChangesFilter::new(PostgresEvent::Insert, "public").table("t"),
            |_| {},
        );
        let statuses = subscribe(&channel);
        let join = socket.last_sent("phx_join").unwrap();

        reply(
            &channel,
            &join,
            "ok",
            json!({"postgres_changes": [
                {"event": "INSERT", "schema": "public", "table": "other", "filter": "", "id": 7}
            ]}),
        );

        assert_eq!(
            statuses.lock()[0],
            (SubscribeStatus::ChannelError, Some(ChannelError::PostgresMismatch))
        );
        assert!(channel.is_leaving());
        assert_eq!(socket.sent_events("phx_leave").len(), 1);
        assert_eq!(channel.postgres_bindings()[0].1, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_postgres_reconciliation_by_position() {
        let socket = MockSocket::connected();
        let channel = channel_on(&socket, options());
        channel
            .on_postgres_changes(
                PostgresChangesFilter::new(PostgresEvent::Insert, "public").table("t"),
                |_| {},
            )
            .on_postgres_changes(
                PostgresChangesFilter::new(PostgresEvent::Delete, "public")
                    .table("u")
                    .filter("id=eq.1"),
                |_| {},
            );
        let statuses = subscribe(&channel);
        let join = socket.last_sent("phx_join").unwrap();

        reply(
            &channel,
            &join,
            "ok",
            json!({"postgres_changes": [
                {"event": "INSERT", "schema": "public", "table": "t", "filter": "", "id": 7},
                {"event": "DELETE", "schema": "public", "table": "u", "filter": "id=eq.1", "id": 9}
            ]}),
        );

        assert_eq!(statuses.lock()[0], (SubscribeStatus::Subscribed, None));
        let ids: Vec<_> = channel.postgres_bindings().into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, vec![Some(7), Some(9)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_hook_dispatches_like_no_hook() {
        let (channel, _, _) = joined(options());
        let (exact, exact_hook) = collect_payloads();
        let (wildcard, wildcard_hook) = collect_payloads();
        let (other, other_hook) = collect_payloads();
        channel
            .on_broadcast("a", exact_hook)
            .on_broadcast("*", wildcard_hook)
            .on_broadcast("b", other_hook);

        let events = [
            json!({"type": "broadcast", "event": "a", "payload": {"n": 1}}),
            json!({"type": "broadcast", "event": "b", "payload": {"n": 2}}),
            json!({"type": "broadcast", "event": "c", "payload": {"n": 3}}),
        ];
        let dispatch_all = || {
            for payload in &events {
                channel.trigger("broadcast", payload.clone(), None).unwrap();
            }
            let counts = (exact.lock().len(), wildcard.lock().len(), other.lock().len());
            exact.lock().clear();
            wildcard.lock().clear();
            other.lock().clear();
            counts
        };

        let without_hook = dispatch_all();
        channel.set_message_hook(|_, payload, _| Some(payload));
        let with_hook = dispatch_all();

        assert_eq!(without_hook, (1, 3, 1));
        assert_eq!(with_hook, without_hook);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_without_ack_resolves_immediately() {
        let (channel, socket, _) = joined(options());

        let mut status = channel
            .send(OutboundMessage::broadcast("x", json!({})))
            .unwrap();
        assert_eq!(status.try_take(), Some(SendStatus::Ok));

        let frame = socket.last_sent("broadcast").unwrap();
        assert_eq!(
            frame.payload,
            json!({"type": "broadcast", "event": "x", "payload": {}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_with_ack_waits_for_reply() {
        let (channel, socket, _) = joined(options().with_broadcast_ack(true));

        let mut status = channel
            .send(OutboundMessage::broadcast("x", json!({})))
            .unwrap();
        assert_eq!(status.try_take(), None);

        let frame = socket.last_sent("broadcast").unwrap();
        reply(&channel, &frame, "ok", json!({}));
        assert_eq!(status.await, Ok(SendStatus::Ok));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_with_ack_times_out() {
        let (channel, _, _) = joined(options().with_broadcast_ack(true));

        let status = channel
            .send(OutboundMessage::broadcast("x", json!({})))
            .unwrap();
        assert_eq!(status.await, Ok(SendStatus::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_ack_after_timeout_reaches_push() {
        let (channel, socket, _) = joined(options());
        let push = channel.push("note", json!({}), TIMEOUT).unwrap();
        let (seen, hook) = collect_payloads();
        push.receive("ok", hook);

        tokio::time::sleep(TIMEOUT + Duration::from_millis(1)).await;
        assert!(push.has_received(&ReplyStatus::Timeout));

        let frame = socket.last_sent("note").unwrap();
        reply(&channel, &frame, "ok", json!({"late": true}));
        assert_eq!(*seen.lock(), vec![json!({"late": true})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_after_late_window_dropped() {
        let (channel, socket, _) = joined(options());
        let push = channel.push("note", json!({}), TIMEOUT).unwrap();
        let (seen, hook) = collect_payloads();
        push.receive("ok", hook);
        assert_eq!(channel.pending_replies(), 1);

        tokio::time::sleep(TIMEOUT + Duration::from_millis(1)).await;
        assert_eq!(channel.pending_replies(), 1);

        tokio::time::sleep(LATE_REPLY_WINDOW).await;
        assert_eq!(channel.pending_replies(), 0);

        let frame = socket.last_sent("note").unwrap();
        reply(&channel, &frame, "ok", json!({"late": true}));
        assert!(seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcasts_without_ack_not_tracked() {
        let (channel, socket, _) = joined(options());

        for i in 0..100 {
            let mut status = channel
                .send(OutboundMessage::broadcast("x", json!({"i": i})))
                .unwrap();
            assert_eq!(status.try_take(), Some(SendStatus::Ok));
        }
        assert_eq!(socket.sent_events("broadcast").len(), 100);
        assert_eq!(channel.pending_replies(), 0);

        tokio::time::sleep(TIMEOUT + LATE_REPLY_WINDOW).await;
        assert_eq!(channel.pending_replies(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_acks_evicted() {
        let (channel, _, _) = joined(options().with_broadcast_ack(true));

        let statuses: Vec<_> = (0..100)
            .map(|i| {
                channel
                    .send(OutboundMessage::broadcast("x", json!({"i": i})))
                    .unwrap()
            })
            .collect();
        assert_eq!(channel.pending_replies(), 100);

        tokio::time::sleep(TIMEOUT + LATE_REPLY_WINDOW + Duration::from_millis(1)).await;
        assert_eq!(channel.pending_replies(), 0);
        for status in statuses {
            assert_eq!(status.await, Ok(SendStatus::TimedOut));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_send() {
        let (channel, socket, _) = joined(options().with_broadcast_ack(true));
        socket.set_rate_limited(true);

        let mut status = channel
            .send(OutboundMessage::broadcast("x", json!({})))
            .unwrap();
        assert_eq!(status.try_take(), Some(SendStatus::RateLimited));
        assert!(socket.sent_events("broadcast").is_empty());

        let push = channel.push("note", json!({}), TIMEOUT).unwrap();
        assert!(push.is_rate_limited());
        assert!(push.is_sent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_before_join_fails() {
        let socket = MockSocket::connected();
        let channel = channel_on(&socket, options());

        let err = channel.push("note", json!({}), TIMEOUT).unwrap_err();
        assert!(err.is_misuse());
        assert!(matches!(
            channel.send(OutboundMessage::broadcast("x", json!({}))),
            Err(ChannelError::PushBeforeJoin { .. })
        ));
        assert!(socket.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_while_disconnected() {
        let socket = MockSocket::disconnected();
        let channel = channel_on(&socket, options());
        let statuses = subscribe(&channel);

        let mut status = channel.unsubscribe();
        assert_eq!(status.try_take(), Some(SendStatus::Ok));
        assert!(channel.is_closed());
        assert!(socket.sent_events("phx_leave").is_empty());
        assert_eq!(socket.removed(), vec![TOPIC.to_string()]);
        assert_eq!(statuses.lock().last().unwrap().0, SubscribeStatus::Closed);

        // The destroyed join push must not time out into a rejoin.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(channel.is_closed());
        assert!(!channel.inner.rejoin_timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_when_closed_is_noop() {
        let socket = MockSocket::disconnected();
        let channel = channel_on(&socket, options());
        let statuses = subscribe(&channel);
        let mut first = channel.unsubscribe();
        assert_eq!(first.try_take(), Some(SendStatus::Ok));
        let closes = statuses.lock().len();

        socket.set_connected(true);
        let mut second = channel.unsubscribe();
        assert_eq!(second.try_take(), Some(SendStatus::Ok));
        assert!(channel.is_closed());
        assert!(socket.sent_events("phx_leave").is_empty());
        assert_eq!(socket.removed().len(), 1);
        assert_eq!(statuses.lock().len(), closes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_while_joined() {
        let (channel, socket, statuses) = joined(options());

        let status = channel.unsubscribe();
        assert!(channel.is_leaving());
        let leave = socket.last_sent("phx_leave").unwrap();
        assert_eq!(leave.payload, json!({}));

        reply(&channel, &leave, "ok", json!({}));
        assert_eq!(status.await, Ok(SendStatus::Ok));
        assert!(channel.is_closed());
        assert_eq!(statuses.lock().last().unwrap().0, SubscribeStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_timeout_still_closes() {
        let (channel, _, _) = joined(options());

        let status = channel.unsubscribe();
        assert_eq!(status.await, Ok(SendStatus::TimedOut));
        assert!(channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_lifecycle_events_ignored() {
        let (channel, _, _) = joined(options());
        let join_ref = channel.join_ref().unwrap();

        channel
            .trigger(EventType::Close, json!({}), Some("stale"))
            .unwrap();
        assert!(channel.is_joined());

        let stale = Frame::new(TOPIC, "phx_error", json!({})).with_join_ref("stale");
        channel.handle_frame(stale).unwrap();
        assert!(channel.is_joined());

        let other_topic = Frame::new("realtime:other", "phx_close", json!({}));
        channel.handle_frame(other_topic).unwrap();
        assert!(channel.is_joined());

        channel
            .trigger(EventType::Close, json!({}), Some(join_ref.as_str()))
            .unwrap();
        assert!(channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_rejoins_when_connected() {
        let (channel, socket, statuses) = joined(options());

        channel
            .trigger(EventType::Error, json!({"reason": "crash"}), None)
            .unwrap();
        assert!(channel.is_errored());
        assert_eq!(
            statuses.lock().last().cloned(),
            Some((
                SubscribeStatus::ChannelError,
                Some(ChannelError::Server("crash".into()))
            ))
        );

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(channel.is_joining());
        assert_eq!(socket.sent_events("phx_join").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_waits_while_disconnected() {
        let (channel, socket, _) = joined(options());
        socket.set_connected(false);

        channel.trigger(EventType::Error, json!({}), None).unwrap();
        tokio::time::sleep(Duration::from_millis(1001)).await;

        assert!(channel.is_errored());
        assert_eq!(channel.inner.rejoin_timer.tries(), 2);
        assert_eq!(socket.sent_events("phx_join").len(), 1);

        socket.set_connected(true);
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(channel.is_joining());
        assert_eq!(socket.sent_events("phx_join").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_ignored_while_leaving() {
        let (channel, _, _) = joined(options());
        let _status = channel.unsubscribe();

        channel.trigger(EventType::Error, json!({}), None).unwrap();
        assert!(channel.is_leaving());
        assert!(!channel.inner.rejoin_timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_dispatch() {
        let (channel, _, _) = joined(options());
        let (cursor, on_cursor) = collect_payloads();
        let (all, on_all) = collect_payloads();
        channel.on_broadcast("cursor", on_cursor).on_broadcast("*", on_all);

        let payload = json!({"type": "broadcast", "event": "cursor", "payload": {"x": 1}});
        channel
            .handle_frame(Frame::new(TOPIC, "broadcast", payload.clone()))
            .unwrap();
        channel
            .handle_frame(Frame::new(
                TOPIC,
                "broadcast",
                json!({"type": "broadcast", "event": "chat"}),
            ))
            .unwrap();

        assert_eq!(*cursor.lock(), vec![payload]);
        assert_eq!(all.lock().len(), 2);

        assert_eq!(channel.off(&BindingFilter::Broadcast(EventFilter::new("cursor"))), 1);
        channel
            .trigger("broadcast", json!({"event": "cursor"}), None)
            .unwrap();
        assert_eq!(cursor.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_hook() {
        let (channel, _, _) = joined(options());
        let (seen, hook) = collect_payloads();
        channel.on_broadcast("*", hook);

        channel.set_message_hook(|_, payload, _| Some(payload));
        channel
            .trigger("broadcast", json!({"event": "a"}), None)
            .unwrap();
        assert_eq!(seen.lock().len(), 1);

        channel.set_message_hook(|_, _, _| None);
        assert_eq!(
            channel.trigger("broadcast", json!({"event": "a"}), None),
            Err(ChannelError::PayloadDropped("broadcast".into()))
        );
        assert!(channel.trigger("broadcast", Value::Null, None).is_ok());
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_postgres_update_enriched() {
        let socket = MockSocket::connected();
        let channel = channel_on(&socket, options());
        let (seen, hook) = collect_payloads();
        channel.on_postgres_changes(PostgresChangesFilter::new(PostgresEvent::All, "public"), hook);
        subscribe(&channel);

        let join = socket.last_sent("phx_join").unwrap();
        reply(
            &channel,
            &join,
            "ok",
            json!({"postgres_changes": [{"event": "*", "schema": "public", "id": 3}]}),
        );

        let change = json!({
            "ids": [3],
            "data": {
                "schema": "public",
                "table": "todos",
                "commit_timestamp": "2024-05-01T10:00:00Z",
                "type": "UPDATE",
                "columns": [{"name": "id", "type": "int4"}, {"name": "done", "type": "bool"}],
                "record": {"id": "1", "done": "t"},
                "old_record": {"id": "1"},
                "errors": null
            }
        });
        channel
            .handle_frame(Frame::new(TOPIC, "postgres_changes", change))
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["eventType"], "UPDATE");
        assert_eq!(seen[0]["table"], "todos");
        assert_eq!(seen[0]["new"], json!({"id": 1, "done": true}));
        assert_eq!(seen[0]["old"], json!({"id": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_row_change_events_skip_enrichment() {
        let (channel, _, _) = joined(options());
        let (seen, hook) = collect_payloads();
        channel.on_postgres_changes(PostgresChangesFilter::new(PostgresEvent::Delete, "public"), hook);

        channel.trigger("INSERT", json!({"ids": [1]}), None).unwrap();
        channel.trigger("delete", json!({"ids": [1]}), None).unwrap();
        assert_eq!(*seen.lock(), vec![json!({"ids": [1]})]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_sync() {
        let (channel, _, _) = joined(options());
        let (events, hook) = collect_payloads();
        channel.on_presence("*", hook);

        channel
            .handle_frame(Frame::new(
                TOPIC,
                "presence_state",
                json!({"alice": {"metas": [{"phx_ref": "a1", "status": "online"}]}}),
            ))
            .unwrap();

        let state = channel.presence_state();
        assert_eq!(state["alice"], vec![json!({"presence_ref": "a1", "status": "online"})]);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"], "join");
        assert_eq!(events[0]["key"], "alice");
        assert_eq!(events[1], json!({"event": "sync"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_and_untrack() {
        let (channel, socket, _) = joined(options());
        let _ = channel.track(json!({"status": "online"})).unwrap();
        let _ = channel.untrack().unwrap();

        let sent = socket.sent_events("presence");
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0].payload,
            json!({"type": "presence", "event": "track", "payload": {"status": "online"}})
        );
        assert_eq!(sent[1].payload["event"], "untrack");
    }

    #[tokio::test(start_paused = true)]
    async fn test_access_token_in_join() {
        let socket = MockSocket::connected();
        socket.set_token(Some("secret"));
        let channel = channel_on(&socket, options());
        subscribe(&channel);

        let join = socket.last_sent("phx_join").unwrap();
        assert_eq!(join.payload["access_token"], "secret");

        reply(&channel, &join, "ok", json!({}));
        assert_eq!(socket.auth_calls(), vec![Some("secret".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_access_token_while_joined() {
        let (channel, socket, _) = joined(options());
        channel.set_access_token(Some("fresh".into()));

        let frame = socket.last_sent("access_token").unwrap();
        assert_eq!(frame.payload, json!({"access_token": "fresh"}));
        assert_eq!(channel.inner.join_push.payload()["access_token"], "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown() {
        let socket = MockSocket::connected();
        let channel = channel_on(&socket, options());
        subscribe(&channel);
        let push = channel.push("note", json!({}), TIMEOUT).unwrap();
        let (seen, hook) = collect_payloads();
        push.receive("timeout", hook);

        channel.teardown();
        assert!(channel.is_closed());
        assert_eq!(channel.buffered_pushes(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(seen.lock().is_empty());
        assert!(channel.is_closed());
        assert!(!channel.inner.rejoin_timer.is_pending());
    }
}

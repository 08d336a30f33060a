//! Acknowledged outbound messages.
//!
//! A [`Push`] sends one event to its channel's topic and waits for the
//! matching `phx_reply`, correlated by a reference the socket allocates.
//! If no reply arrives within the timeout, the push resolves locally with
//! [`ReplyStatus::Timeout`].
//!
//! Callbacks are registered per status with [`Push::receive`]. A callback
//! registered after its status was already received is invoked right away.
//!
//! A reply arriving after the local timeout is still delivered, as long as
//! it arrives within [`LATE_REPLY_WINDOW`] of the timeout.

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tether_protocol::{Frame, Reply, ReplyStatus};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::ChannelInner;
use crate::error::ChannelError;
use crate::metrics;
use crate::socket::SocketError;

/// How long a timed-out push still accepts a late reply.
pub const LATE_REPLY_WINDOW: Duration = Duration::from_secs(10);

/// Callback invoked with the response body of a reply.
pub type ReplyHook = Arc<dyn Fn(&Value) + Send + Sync>;

/// An acknowledged outbound message.
///
/// Cloning a push yields another handle to the same message.
#[derive(Clone)]
pub struct Push {
    inner: Arc<PushInner>,
}

struct PushInner {
    channel: Weak<ChannelInner>,
    event: String,
    /// Whether the server answers this push at all.
    acknowledged: bool,
    state: Mutex<PushState>,
}

struct PushState {
    payload: Value,
    timeout: Duration,
    reference: Option<String>,
    attempt: u64,
    sent: bool,
    rate_limited: bool,
    received: Option<Reply>,
    hooks: Vec<(ReplyStatus, ReplyHook)>,
    timer: Option<JoinHandle<()>>,
}

impl PushState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Push {
    pub(crate) fn new(
        channel: Weak<ChannelInner>,
        event: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> Self {
        Self::build(channel, event.into(), payload, timeout, true)
    }

    /// Create a push the server never replies to.
    ///
    /// It is not registered for reply correlation; only its local timeout
    /// can resolve it.
    pub(crate) fn unacknowledged(
        channel: Weak<ChannelInner>,
        event: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> Self {
        Self::build(channel, event.into(), payload, timeout, false)
    }

    fn build(
        channel: Weak<ChannelInner>,
        event: String,
        payload: Value,
        timeout: Duration,
        acknowledged: bool,
    ) -> Self {
        Self {
            inner: Arc::new(PushInner {
                channel,
                event,
                acknowledged,
                state: Mutex::new(PushState {
                    payload,
                    timeout,
                    reference: None,
                    attempt: 0,
                    sent: false,
                    rate_limited: false,
                    received: None,
                    hooks: Vec::new(),
                    timer: None,
                }),
            }),
        }
    }

    /// Get the event name.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.inner.event
    }

    /// Get the current correlation reference, if one was allocated.
    #[must_use]
    pub fn reference(&self) -> Option<String> {
        self.inner.state.lock().reference.clone()
    }

    /// Get a copy of the payload.
    #[must_use]
    pub fn payload(&self) -> Value {
        self.inner.state.lock().payload.clone()
    }

    /// Get the timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.state.lock().timeout
    }

    /// Check if the push was handed to the socket.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.inner.state.lock().sent
    }

    /// Check if the socket refused the last send because of rate limiting.
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.inner.state.lock().rate_limited
    }

    /// Check if a reply with `status` was recorded for the current attempt.
    #[must_use]
    pub fn has_received(&self, status: &ReplyStatus) -> bool {
        self.inner
            .state
            .lock()
            .received
            .as_ref()
            .is_some_and(|r| r.status == *status)
    }

    /// Send the push.
    ///
    /// Arms the timeout if it is not already running. When the socket
    /// reports rate limiting, the timeout is disarmed and the push is
    /// flagged instead.
    pub fn send(&self) {
        if self.has_received(&ReplyStatus::Timeout) {
            return;
        }
        let Some(channel) = self.inner.channel.upgrade() else {
            debug!(event = %self.inner.event, "Dropping push for a discarded channel");
            return;
        };

        let reference = self.arm(&channel);
        let join_ref = channel.join_ref();

        let frame = {
            let mut state = self.inner.state.lock();
            state.sent = true;
            state.rate_limited = false;
            let mut frame = Frame::new(channel.topic(), &self.inner.event, state.payload.clone())
                .with_ref(reference.clone());
            frame.join_ref = join_ref;
            frame
        };

        match channel.socket().push(frame) {
            Ok(()) => metrics::record_push(&self.inner.event),
            Err(SocketError::RateLimited) => {
                {
                    let mut state = self.inner.state.lock();
                    state.rate_limited = true;
                    state.cancel_timer();
                }
                channel.unregister_reply(&reference);
                metrics::record_rate_limited();
            }
            Err(e) => {
                warn!(
                    topic = %channel.topic(),
                    event = %self.inner.event,
                    "Socket failed to send push: {}",
                    e
                );
            }
        }
    }

    /// Arm the timeout without sending.
    ///
    /// Used for pushes buffered until the channel joins, so that they
    /// still expire if never flushed.
    pub fn start_timeout(&self) {
        match self.inner.channel.upgrade() {
            Some(channel) => {
                self.arm(&channel);
            }
            None => debug!(event = %self.inner.event, "Cannot arm timeout for a discarded channel"),
        }
    }

    /// Allocate a reference and start the timeout, unless already armed.
    fn arm(&self, channel: &Arc<ChannelInner>) -> String {
        let (current, timeout) = {
            let state = self.inner.state.lock();
            let current = state
                .reference
                .clone()
                .filter(|_| state.timer.is_some());
            (current, state.timeout)
        };
        if let Some(reference) = current {
            return reference;
        }

        let reference = channel.socket().make_ref();
        let previous = {
            let mut state = self.inner.state.lock();
            state.attempt += 1;
            let attempt = state.attempt;
            state.cancel_timer();
            state.timer = spawn_timeout(Arc::downgrade(&self.inner), attempt, timeout);
            state.reference.replace(reference.clone())
        };

        if let Some(previous) = previous {
            channel.unregister_reply(&previous);
        }
        if self.inner.acknowledged {
            channel.register_reply(reference.clone(), self.clone());
        }
        reference
    }

    /// Resolve the push with a reply.
    ///
    /// Records the reply and invokes every callback registered for
    /// `status`. Any status other than timeout disarms the timeout.
    pub fn trigger(&self, status: ReplyStatus, response: Value) {
        let hooks: Vec<ReplyHook> = {
            let mut state = self.inner.state.lock();
            if status != ReplyStatus::Timeout {
                state.cancel_timer();
            }
            state.received = Some(Reply::new(status.clone(), response.clone()));
            state
                .hooks
                .iter()
                .filter(|(s, _)| *s == status)
                .map(|(_, hook)| Arc::clone(hook))
                .collect()
        };

        if status == ReplyStatus::Timeout && self.inner.acknowledged {
            metrics::record_push_timeout(&self.inner.event);
        }

        for hook in hooks {
            hook(&response);
        }
    }

    /// Register a callback for replies with `status`.
    ///
    /// Callbacks for the same status fire in registration order.
    pub fn receive<F>(&self, status: impl Into<ReplyStatus>, callback: F) -> &Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let status = status.into();
        let hook: ReplyHook = Arc::new(callback);

        let replay = {
            let mut state = self.inner.state.lock();
            state.hooks.push((status.clone(), Arc::clone(&hook)));
            state
                .received
                .as_ref()
                .filter(|r| r.status == status)
                .map(|r| r.response.clone())
        };

        if let Some(response) = replay {
            hook(&response);
        }
        self
    }

    /// Send again with a fresh reference and timeout window.
    pub fn resend(&self, timeout: Duration) {
        let previous = {
            let mut state = self.inner.state.lock();
            state.timeout = timeout;
            state.cancel_timer();
            state.received = None;
            state.sent = false;
            state.rate_limited = false;
            state.reference.take()
        };

        if let (Some(previous), Some(channel)) = (previous, self.inner.channel.upgrade()) {
            channel.unregister_reply(&previous);
        }
        self.send();
    }

    /// Shallow-merge `partial` into the payload.
    pub fn update_payload(&self, partial: Map<String, Value>) {
        let mut state = self.inner.state.lock();
        if !state.payload.is_object() {
            state.payload = Value::Object(Map::new());
        }
        if let Value::Object(payload) = &mut state.payload {
            payload.extend(partial);
        }
    }

    /// Disarm the timeout, detach from reply correlation and drop callbacks.
    pub fn destroy(&self) {
        let reference = {
            let mut state = self.inner.state.lock();
            state.cancel_timer();
            state.hooks.clear();
            state.reference.clone()
        };

        if let (Some(reference), Some(channel)) = (reference, self.inner.channel.upgrade()) {
            channel.unregister_reply(&reference);
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Push) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn spawn_timeout(push: Weak<PushInner>, attempt: u64, timeout: Duration) -> Option<JoinHandle<()>> {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => Some(runtime.spawn(expire(push, attempt, timeout))),
        Err(_) => {
            warn!("Push timeout armed outside of a Tokio runtime; it will never expire");
            None
        }
    }
}

async fn expire(push: Weak<PushInner>, attempt: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    let Some(reference) = time_out(&push, attempt) else {
        return;
    };

    tokio::time::sleep(LATE_REPLY_WINDOW).await;

    let Some(channel) = push.upgrade().and_then(|inner| inner.channel.upgrade()) else {
        return;
    };
    channel.react(|| channel.unregister_reply(&reference));
}

/// Resolve `attempt` with a local timeout. Returns the timed-out reference
/// if the attempt was still current.
fn time_out(push: &Weak<PushInner>, attempt: u64) -> Option<String> {
    let inner = push.upgrade()?;
    let channel = inner.channel.upgrade()?;
    let push = Push { inner };

    channel.react(|| {
        let reference = {
            let mut state = push.inner.state.lock();
            if state.attempt != attempt || state.timer.is_none() {
                return None;
            }
            state.timer = None;
            state.reference.clone()
        };
        debug!(topic = %channel.topic(), event = %push.inner.event, "Push timed out");
        push.trigger(ReplyStatus::Timeout, json!({}));
        reference
    })
}

impl fmt::Debug for Push {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Push")
            .field("event", &self.inner.event)
            .field("reference", &state.reference)
            .field("sent", &state.sent)
            .field("rate_limited", &state.rate_limited)
            .field("received", &state.received.as_ref().map(|r| &r.status))
            .finish()
    }
}

/// Future resolving to the outcome of an asynchronous channel operation.
///
/// Resolves to [`ChannelError::Canceled`] if the operation was discarded
/// without an outcome.
#[derive(Debug)]
pub struct ReplyFuture<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> ReplyFuture<T> {
    /// Take the outcome if it is already available.
    pub fn try_take(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Future for ReplyFuture<T> {
    type Output = Result<T, ChannelError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|result| result.map_err(|_| ChannelError::Canceled))
    }
}

/// Resolving half of a [`ReplyFuture`]. Only the first resolution counts.
pub(crate) struct Resolver<T> {
    tx: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<T> Resolver<T> {
    pub(crate) fn resolve(&self, value: T) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

pub(crate) fn reply_channel<T>() -> (Resolver<T>, ReplyFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Resolver {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        ReplyFuture { rx },
    )
}

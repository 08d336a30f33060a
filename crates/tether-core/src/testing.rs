//! In-memory socket for channel tests.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_protocol::Frame;

use crate::socket::{RefCounter, Socket, SocketError};

/// Records every frame pushed while connected.
#[derive(Debug, Default)]
pub(crate) struct MockSocket {
    connected: AtomicBool,
    rate_limited: AtomicBool,
    refs: RefCounter,
    token: Mutex<Option<String>>,
    sent: Mutex<Vec<Frame>>,
    removed: Mutex<Vec<String>>,
    left_topics: Mutex<Vec<String>>,
    auth_calls: Mutex<Vec<Option<String>>>,
}

impl MockSocket {
    pub(crate) fn connected() -> Arc<Self> {
        let socket = Self::default();
        socket.connected.store(true, Ordering::SeqCst);
        Arc::new(socket)
    }

    pub(crate) fn disconnected() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub(crate) fn set_rate_limited(&self, rate_limited: bool) {
        self.rate_limited.store(rate_limited, Ordering::SeqCst);
    }

    pub(crate) fn set_token(&self, token: Option<&str>) {
        *self.token.lock() = token.map(str::to_string);
    }

    pub(crate) fn sent(&self) -> Vec<Frame> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_events(&self, event: &str) -> Vec<Frame> {
        self.sent
            .lock()
            .iter()
            .filter(|f| f.event == event)
            .cloned()
            .collect()
    }

    pub(crate) fn last_sent(&self, event: &str) -> Option<Frame> {
        self.sent_events(event).pop()
    }

    pub(crate) fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    pub(crate) fn left_topics(&self) -> Vec<String> {
        self.left_topics.lock().clone()
    }

    pub(crate) fn auth_calls(&self) -> Vec<Option<String>> {
        self.auth_calls.lock().clone()
    }
}

impl Socket for MockSocket {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn push(&self, frame: Frame) -> Result<(), SocketError> {
        if self.rate_limited.load(Ordering::SeqCst) {
            return Err(SocketError::RateLimited);
        }
        if !self.is_connected() {
            return Err(SocketError::ConnectionClosed);
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    fn make_ref(&self) -> String {
        self.refs.next_ref()
    }

    fn access_token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    fn set_auth(&self, token: Option<String>) {
        self.auth_calls.lock().push(token.clone());
        *self.token.lock() = token;
    }

    fn remove(&self, topic: &str) {
        self.removed.lock().push(topic.to_string());
    }

    fn leave_open_topic(&self, topic: &str) {
        self.left_topics.lock().push(topic.to_string());
    }
}

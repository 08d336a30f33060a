//! Event bindings and dispatch matching.
//!
//! Bindings are kept per kind. Broadcast, presence and postgres-changes
//! bindings carry typed filters; every other event type holds generic
//! bindings with an arbitrary JSON object filter.
//!
//! ```text
//!   inbound event ──► EventType ──┬─ insert/update/delete ──► postgres (by row event)
//!                                 ├─ broadcast / presence ──► typed (id or event rule)
//!                                 ├─ postgres_changes ──────► typed (id or event rule)
//!                                 └─ anything else ─────────► generic (by type)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tether_protocol::ChannelEvent;
use tracing::warn;

use crate::error::ChannelError;
use crate::transformer::{Column, RecordTransformer};

/// Callback invoked with the (possibly enriched) payload and the message
/// reference.
pub type Callback = Arc<dyn Fn(&Value, Option<&str>) + Send + Sync>;

/// Canonical inbound event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Broadcast,
    Presence,
    PostgresChanges,
    Insert,
    Update,
    Delete,
    Join,
    Leave,
    Close,
    Error,
    Reply,
    AccessToken,
    PresenceState,
    PresenceDiff,
    System,
    /// Any other event, lower-cased.
    Other(String),
}

impl EventType {
    /// Canonicalize an event name. Matching ignores case.
    #[must_use]
    pub fn parse(event: &str) -> Self {
        let lower = event.to_lowercase();
        match lower.as_str() {
            "broadcast" => EventType::Broadcast,
            "presence" => EventType::Presence,
            "postgres_changes" => EventType::PostgresChanges,
            "insert" => EventType::Insert,
            "update" => EventType::Update,
            "delete" => EventType::Delete,
            "phx_join" => EventType::Join,
            "phx_leave" => EventType::Leave,
            "phx_close" => EventType::Close,
            "phx_error" => EventType::Error,
            "phx_reply" => EventType::Reply,
            "access_token" => EventType::AccessToken,
            "presence_state" => EventType::PresenceState,
            "presence_diff" => EventType::PresenceDiff,
            "system" => EventType::System,
            _ => EventType::Other(lower),
        }
    }

    /// Get the canonical event name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Broadcast => "broadcast",
            EventType::Presence => "presence",
            EventType::PostgresChanges => "postgres_changes",
            EventType::Insert => "insert",
            EventType::Update => "update",
            EventType::Delete => "delete",
            EventType::Join => ChannelEvent::Join.as_str(),
            EventType::Leave => ChannelEvent::Leave.as_str(),
            EventType::Close => ChannelEvent::Close.as_str(),
            EventType::Error => ChannelEvent::Error.as_str(),
            EventType::Reply => ChannelEvent::Reply.as_str(),
            EventType::AccessToken => ChannelEvent::AccessToken.as_str(),
            EventType::PresenceState => "presence_state",
            EventType::PresenceDiff => "presence_diff",
            EventType::System => "system",
            EventType::Other(name) => name,
        }
    }

    /// Check if this is a join/leave/close/error lifecycle event.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            EventType::Join | EventType::Leave | EventType::Close | EventType::Error
        )
    }

    /// Check if this is a row-level change event.
    #[must_use]
    pub fn is_row_change(&self) -> bool {
        matches!(self, EventType::Insert | EventType::Update | EventType::Delete)
    }
}

impl From<&str> for EventType {
    fn from(event: &str) -> Self {
        EventType::parse(event)
    }
}

impl From<String> for EventType {
    fn from(event: String) -> Self {
        EventType::parse(&event)
    }
}

impl From<ChannelEvent> for EventType {
    fn from(event: ChannelEvent) -> Self {
        EventType::parse(event.as_str())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter on the `event` of a broadcast or presence message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    event: String,
}

impl EventFilter {
    /// Match messages with the given event name.
    #[must_use]
    pub fn new(event: impl AsRef<str>) -> Self {
        Self {
            event: event.as_ref().to_lowercase(),
        }
    }

    /// Match every message.
    #[must_use]
    pub fn all() -> Self {
        Self::new("*")
    }

    /// Get the lower-cased event name, `*` for all.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    fn from_object(filter: &Map<String, Value>) -> Self {
        filter
            .get("event")
            .and_then(Value::as_str)
            .map_or_else(Self::all, Self::new)
    }
}

/// Row event a postgres-changes binding listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PostgresEvent {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl PostgresEvent {
    /// Get the wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            PostgresEvent::All => "*",
            PostgresEvent::Insert => "INSERT",
            PostgresEvent::Update => "UPDATE",
            PostgresEvent::Delete => "DELETE",
        }
    }
}

/// Declared postgres-changes subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresChangesFilter {
    pub event: PostgresEvent,
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl PostgresChangesFilter {
    /// Listen to `event` on every table of `schema`.
    #[must_use]
    pub fn new(event: PostgresEvent, schema: impl Into<String>) -> Self {
        Self {
            event,
            schema: schema.into(),
            table: None,
            filter: None,
        }
    }

    /// Restrict to one table.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Restrict to rows matching a server-side filter like `id=eq.1`.
    #[must_use]
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn confirmed_by(&self, server: &ServerPostgresFilter) -> bool {
        let table = self.table.as_deref().unwrap_or_default();
        let filter = self.filter.as_deref().unwrap_or_default();

        server.event == self.event.as_str()
            && server.schema == self.schema
            && server.table.as_deref().unwrap_or_default() == table
            && server.filter.as_deref().unwrap_or_default() == filter
    }
}

/// Server confirmation of a postgres-changes subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPostgresFilter {
    pub event: String,
    pub schema: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
    pub id: u64,
}

/// A filter and callback pair.
#[derive(Clone)]
pub struct Binding<F> {
    pub filter: F,
    /// Server-assigned id, set once the subscription is confirmed.
    pub id: Option<u64>,
    pub callback: Callback,
}

impl<F> Binding<F> {
    fn new(filter: F, callback: Callback) -> Self {
        Self {
            filter,
            id: None,
            callback,
        }
    }

    /// Match by server id when present, otherwise by event name.
    fn matches(&self, filter_event: &str, payload: &Value) -> bool {
        match self.id {
            Some(id) => {
                let carries_id = payload
                    .get("ids")
                    .and_then(Value::as_array)
                    .is_some_and(|ids| ids.iter().any(|v| v.as_u64() == Some(id)));
                let row_event = payload
                    .get("data")
                    .and_then(|d| d.get("type"))
                    .and_then(Value::as_str);
                carries_id && event_matches(filter_event, row_event)
            }
            None => event_matches(filter_event, payload.get("event").and_then(Value::as_str)),
        }
    }
}

impl<F: fmt::Debug> fmt::Debug for Binding<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("filter", &self.filter)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

fn event_matches(filter_event: &str, event: Option<&str>) -> bool {
    filter_event == "*" || event.is_some_and(|e| e.eq_ignore_ascii_case(filter_event))
}

/// What a binding listens to.
#[derive(Debug, Clone, PartialEq)]
pub enum BindingFilter {
    Broadcast(EventFilter),
    Presence(EventFilter),
    PostgresChanges(PostgresChangesFilter),
    /// Any other event type, with a free-form object filter.
    Event(EventType, Map<String, Value>),
}

impl BindingFilter {
    /// Build a filter for `event_type` from a JSON object filter.
    ///
    /// Broadcast, presence and postgres-changes filters are converted to
    /// their typed form.
    #[must_use]
    pub fn from_parts(event_type: impl Into<EventType>, filter: Map<String, Value>) -> Self {
        match event_type.into() {
            EventType::Broadcast => BindingFilter::Broadcast(EventFilter::from_object(&filter)),
            EventType::Presence => BindingFilter::Presence(EventFilter::from_object(&filter)),
            EventType::PostgresChanges => {
                match serde_json::from_value(Value::Object(filter.clone())) {
                    Ok(typed) => BindingFilter::PostgresChanges(typed),
                    Err(e) => {
                        warn!("Invalid postgres changes filter, binding will never match: {}", e);
                        BindingFilter::Event(EventType::PostgresChanges, filter)
                    }
                }
            }
            other => BindingFilter::Event(other, filter),
        }
    }

    /// Event type the filter listens to.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            BindingFilter::Broadcast(_) => EventType::Broadcast,
            BindingFilter::Presence(_) => EventType::Presence,
            BindingFilter::PostgresChanges(_) => EventType::PostgresChanges,
            BindingFilter::Event(ty, _) => ty.clone(),
        }
    }
}

/// Registry of a channel's bindings.
#[derive(Default)]
pub struct Bindings {
    broadcast: Vec<Binding<EventFilter>>,
    presence: Vec<Binding<EventFilter>>,
    postgres: Vec<Binding<PostgresChangesFilter>>,
    generic: HashMap<EventType, Vec<Binding<Map<String, Value>>>>,
}

impl Bindings {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding. Bindings of the same type fire in
    /// registration order.
    pub fn add(&mut self, filter: BindingFilter, callback: Callback) {
        match filter {
            BindingFilter::Broadcast(f) => self.broadcast.push(Binding::new(f, callback)),
            BindingFilter::Presence(f) => self.presence.push(Binding::new(f, callback)),
            BindingFilter::PostgresChanges(f) => self.postgres.push(Binding::new(f, callback)),
            BindingFilter::Event(ty, f) => self
                .generic
                .entry(ty)
                .or_default()
                .push(Binding::new(f, callback)),
        }
    }

    /// Remove every binding with an equal filter. Returns how many were
    /// removed.
    ///
    /// Object filters compare shallowly: same keys with equal scalar
    /// values. Nested objects and arrays never compare equal.
    pub fn remove(&mut self, filter: &BindingFilter) -> usize {
        fn retain<F>(list: &mut Vec<Binding<F>>, keep: impl Fn(&F) -> bool) -> usize {
            let before = list.len();
            list.retain(|b| keep(&b.filter));
            before - list.len()
        }

        match filter {
            BindingFilter::Broadcast(f) => retain(&mut self.broadcast, |b| b != f),
            BindingFilter::Presence(f) => retain(&mut self.presence, |b| b != f),
            BindingFilter::PostgresChanges(f) => retain(&mut self.postgres, |b| b != f),
            BindingFilter::Event(ty, f) => match self.generic.get_mut(ty) {
                Some(list) => retain(list, |b| !shallow_eq(b, f)),
                None => 0,
            },
        }
    }

    /// Number of registered bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.broadcast.len()
            + self.presence.len()
            + self.postgres.len()
            + self.generic.values().map(Vec::len).sum::<usize>()
    }

    /// Check if no binding is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declared postgres-changes filters, in registration order.
    #[must_use]
    pub fn postgres_filters(&self) -> Vec<PostgresChangesFilter> {
        self.postgres.iter().map(|b| b.filter.clone()).collect()
    }

    /// Postgres-changes bindings with their server ids.
    #[must_use]
    pub fn postgres_bindings(&self) -> &[Binding<PostgresChangesFilter>] {
        &self.postgres
    }

    /// Collect the callbacks of every binding matching an inbound event.
    #[must_use]
    pub fn matching(&self, event_type: &EventType, payload: &Value) -> Vec<Callback> {
        if event_type.is_row_change() {
            let row_event = event_type.as_str();
            return self
                .postgres
                .iter()
                .filter(|b| {
                    b.filter.event == PostgresEvent::All
                        || b.filter.event.as_str().eq_ignore_ascii_case(row_event)
                })
                .map(|b| Arc::clone(&b.callback))
                .collect();
        }

        match event_type {
            EventType::Broadcast => matching_in(&self.broadcast, payload, |f| f.event()),
            EventType::Presence => matching_in(&self.presence, payload, |f| f.event()),
            EventType::PostgresChanges => matching_in(&self.postgres, payload, |f| f.event.as_str()),
            other => self
                .generic
                .get(other)
                .map(|list| list.iter().map(|b| Arc::clone(&b.callback)).collect())
                .unwrap_or_default(),
        }
    }

    /// Attach server ids to the declared postgres bindings.
    ///
    /// Bindings and confirmations are paired by position. Every binding
    /// must be confirmed by an entry with identical event, schema, table
    /// and filter; otherwise nothing is changed.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::PostgresMismatch`] on the first binding that
    /// is not confirmed.
    pub fn reconcile_postgres(&mut self, server: &[ServerPostgresFilter]) -> Result<(), ChannelError> {
        let mut confirmed = Vec::with_capacity(self.postgres.len());

        for (i, binding) in self.postgres.iter().enumerate() {
            match server.get(i) {
                Some(entry) if binding.filter.confirmed_by(entry) => {
                    let mut binding = binding.clone();
                    binding.id = Some(entry.id);
                    confirmed.push(binding);
                }
                _ => return Err(ChannelError::PostgresMismatch),
            }
        }

        self.postgres = confirmed;
        Ok(())
    }
}

fn matching_in<F>(
    list: &[Binding<F>],
    payload: &Value,
    filter_event: impl Fn(&F) -> &str,
) -> Vec<Callback> {
    list.iter()
        .filter(|b| b.matches(filter_event(&b.filter), payload))
        .map(|b| Arc::clone(&b.callback))
        .collect()
}

fn shallow_eq(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    a.len() == b.len()
        && a.iter().all(|(key, value)| match (value, b.get(key)) {
            (Value::Object(_) | Value::Array(_), _) => false,
            (value, Some(other)) => value == other,
            (_, None) => false,
        })
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bindings")
            .field("broadcast", &self.broadcast)
            .field("presence", &self.presence)
            .field("postgres", &self.postgres)
            .field("generic", &self.generic.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Flattened postgres change delivered to bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresChangesPayload {
    pub schema: String,
    pub table: String,
    pub commit_timestamp: Option<String>,
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub new: Map<String, Value>,
    pub old: Map<String, Value>,
    pub errors: Value,
}

/// Reshape a postgres change envelope for delivery.
///
/// Returns `None` if `payload` is not an envelope (no `ids`). Records are
/// converted with `transformer`: `new` is filled for inserts and updates,
/// `old` for updates and deletes.
#[must_use]
pub fn enrich_postgres_payload(
    payload: &Value,
    transformer: &dyn RecordTransformer,
) -> Option<Value> {
    payload.as_object()?.get("ids")?;

    let data = payload.get("data").unwrap_or(&Value::Null);
    let text = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let event_type = text("type");
    let columns: Vec<Column> = data
        .get("columns")
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .unwrap_or_default();
    let convert = |key: &str| {
        data.get(key)
            .and_then(Value::as_object)
            .map(|record| transformer.convert(&columns, record))
            .unwrap_or_default()
    };

    let new = match event_type.as_str() {
        "INSERT" | "UPDATE" => convert("record"),
        _ => Map::new(),
    };
    let old = match event_type.as_str() {
        "UPDATE" | "DELETE" => convert("old_record"),
        _ => Map::new(),
    };

    let enriched = PostgresChangesPayload {
        schema: text("schema"),
        table: text("table"),
        commit_timestamp: data
            .get("commit_timestamp")
            .and_then(Value::as_str)
            .map(str::to_string),
        event_type,
        new,
        old,
        errors: data.get("errors").cloned().unwrap_or(Value::Null),
    };

    serde_json::to_value(enriched).ok()
}

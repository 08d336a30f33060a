//! # tether-core
//!
//! Client-side channel protocol engine for tether realtime connections.
//!
//! This crate provides the building blocks a socket implementation needs
//! to multiplex topics over one connection:
//!
//! - **Channel** - Join/leave lifecycle, push buffering and rejoin backoff
//! - **Push** - Acknowledged outbound messages with timeouts
//! - **Bindings** - Event subscriptions and postgres-changes reconciliation
//! - **Presence** - Client-side presence state
//! - **RetryTimer** - Backoff-driven retry scheduling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ frames ┌─────────────┐     ┌─────────────┐
//! │   Socket    │───────▶│   Channel   │────▶│  Bindings   │
//! └─────────────┘        └─────────────┘     └─────────────┘
//!        ▲                 │    │    │
//!        │    push/reply   │    │    ▼
//!        └─────────────────┘    │ ┌─────────────┐
//!                               │ │  Presence   │
//!                               ▼ └─────────────┘
//!                        ┌─────────────┐
//!                        │ RetryTimer  │
//!                        └─────────────┘
//! ```
//!
//! The host application implements [`Socket`] on top of its transport and
//! feeds every inbound frame to [`Channel::handle_frame`].

pub mod binding;
pub mod channel;
pub mod error;
pub mod metrics;
pub mod options;
pub mod presence;
pub mod push;
pub mod socket;
pub mod timer;
pub mod transformer;

#[cfg(test)]
mod testing;

pub use binding::{
    BindingFilter, Bindings, EventFilter, EventType, PostgresChangesFilter, PostgresEvent,
};
pub use channel::{
    Channel, ChannelState, MessageKind, OutboundMessage, SendStatus, SubscribeStatus,
};
pub use error::{ChannelError, ErrorKind};
pub use options::{ChannelOptions, ConfigError};
pub use presence::{Presence, PresenceChange, PresenceMap};
pub use push::{Push, ReplyFuture};
pub use socket::{RefCounter, Socket, SocketError};
pub use timer::RetryTimer;
pub use transformer::{Column, PostgresTransformer, RecordTransformer};
pub use tether_protocol::{Frame, ReplyStatus};

//! # tether-protocol
//!
//! Wire protocol definitions for tether realtime channels.
//!
//! Many channels share one connection. Each frame names the topic it belongs
//! to, the event, a JSON payload, and the references used to correlate
//! replies with pushes and pushes with join attempts.
//!
//! ## Reserved Events
//!
//! - `phx_join` / `phx_leave` - Channel membership
//! - `phx_reply` - Acknowledgment of a push (`ok`, `error`, ...)
//! - `phx_close` / `phx_error` - Channel lifecycle
//! - `access_token` - Token refresh for joined channels
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, Frame, ReplyStatus};
//!
//! let frame = Frame::reply("realtime:lobby", "12", ReplyStatus::Ok, serde_json::json!({}));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.as_reply().unwrap().status, ReplyStatus::Ok);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{ChannelEvent, Frame, Reply, ReplyStatus};

//! Connection and channel lifecycle management for Phoenix-style realtime
//! sockets.
//!
//! Maintains exactly one logical connection to a realtime server,
//! multiplexes named topics over it, tracks connection and channel state,
//! re-establishes connectivity after transient failures, and exposes
//! subscribe/publish primitives decoupled from the transport's quirks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  RealtimeClient                     │
//! │        (facade + process-wide registry)             │
//! └─────────────────────────────────────────────────────┘
//!            │                            │
//!            ▼                            ▼
//! ┌─────────────────────┐      ┌─────────────────────┐
//! │  ConnectionManager  │─────▶│   ChannelManager    │
//! │  (single transport, │ swap │ (topic → channel,   │
//! │   backoff, recovery)│      │  bounded registries)│
//! └─────────────────────┘      └─────────────────────┘
//!            │                            │
//!            └──────────┬─────────────────┘
//!                       ▼
//!            ┌─────────────────────┐
//!            │      EventBus       │
//!            │ (bounded lifecycle  │
//!            │      fan-out)       │
//!            └─────────────────────┘
//! ```
//!
//! The transport itself is a collaborator behind the traits in
//! [`transport`]: anything exposing socket open/close/error callbacks and
//! topic channels with acknowledged join/leave/push will do.
//!
//! # Usage
//!
//! ```rust,ignore
//! use phoenix_realtime::{ConnectionParams, EnvConfig, RealtimeClient};
//! use std::sync::Arc;
//!
//! let client = RealtimeClient::new(factory, storage, EnvConfig::from_env());
//! client.connect(ConnectionParams {
//!     endpoint: Some("wss://example.com/socket".into()),
//!     ..Default::default()
//! }).await?;
//!
//! client.join_channel("room:lobby", serde_json::json!({})).await?;
//! client.send_message("room:lobby", "msg", serde_json::json!({"text": "hi"})).await?;
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod fault;
pub mod storage;
pub mod transport;

pub use channel::{ChannelManager, ChannelResourceStats, ChannelState, ChannelStatus};
pub use client::{global, init_global, RealtimeClient, ResourceStats};
pub use config::{ConfigUpdate, ConnectionParams, EnvConfig, PhoenixConfig};
pub use connection::{BackoffPolicy, ConnectionManager, ConnectionState, ConnectionStatus};
pub use error::Error;
pub use events::{ClientEvent, EventBus, EventBusStats, EventHandler};
pub use storage::{FileStorage, MemoryStorage, StorageAdapter};
pub use transport::{
    MessageCallback, PushStatus, ReconnectDelayFn, SocketTransport, TopicChannel, TransportFactory,
};

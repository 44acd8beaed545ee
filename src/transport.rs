//! Transport contract: anything exposing socket open/close/error callbacks
//! and topic channels with acknowledged join/leave/push.
//!
//! The managers depend only on these traits. The real websocket (or its
//! long-poll fallback) is one conforming implementation, a test double is
//! another. Transport failures are reported as plain strings and converted
//! into [`crate::Error`] at the manager boundary.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Acknowledgment for a join, leave, or push.
#[derive(Debug, Clone)]
pub enum PushStatus {
    /// Acknowledged with a response payload.
    Ok(Value),
    /// Rejected with an error payload.
    Error(Value),
    /// No acknowledgment within the transport's window.
    Timeout,
}

impl PushStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, PushStatus::Ok(_))
    }
}

/// Callback fired when the socket opens.
pub type OpenCallback = Box<dyn Fn() + Send + Sync>;
/// Callback fired when the socket or a channel closes.
pub type CloseCallback = Box<dyn Fn() + Send + Sync>;
/// Callback fired with the transport's error text.
pub type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;
/// Callback fired with an incoming message payload. Identity (the `Arc`
/// pointer) is used for listener de-duplication.
pub type MessageCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Backoff function consulted by the transport's own low-level retry,
/// mapping attempt count to delay.
pub type ReconnectDelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// A live socket connection.
#[async_trait]
pub trait SocketTransport: Send + Sync {
    /// Whether the transport self-reports connected.
    fn is_connected(&self) -> bool;

    /// Register the open callback. May fire immediately if already open.
    fn on_open(&self, cb: OpenCallback);

    /// Register the close callback.
    fn on_close(&self, cb: CloseCallback);

    /// Register the error callback.
    fn on_error(&self, cb: ErrorCallback);

    /// Gracefully close the connection.
    async fn close(&self) -> Result<(), String>;

    /// Create a channel object scoped to a topic. Creation does not join.
    fn channel(&self, topic: &str, params: Value) -> Arc<dyn TopicChannel>;
}

/// A channel object scoped to one topic.
#[async_trait]
pub trait TopicChannel: Send + Sync {
    fn topic(&self) -> &str;

    /// Issue the join request and await the server's acknowledgment.
    async fn join(&self) -> PushStatus;

    /// Issue the leave request and await acknowledgment.
    async fn leave(&self) -> PushStatus;

    /// Push an event and await acknowledgment. `push_ref` correlates the
    /// acknowledgment with the request.
    async fn push(&self, event: &str, payload: Value, push_ref: &str) -> PushStatus;

    /// Register a message listener, returning a reference for removal.
    fn on(&self, event: &str, cb: MessageCallback) -> u64;

    /// Remove a previously registered listener.
    fn off(&self, event: &str, listener_ref: u64);

    /// Register the channel error callback.
    fn on_error(&self, cb: ErrorCallback);

    /// Register the channel close callback.
    fn on_close(&self, cb: CloseCallback);
}

/// Constructs transport connections.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Construct and start a connection to `url`. The transport owns its
    /// low-level retry loop and consults `reconnect_delay` between attempts.
    async fn connect(
        &self,
        url: &str,
        params: Value,
        reconnect_delay: ReconnectDelayFn,
    ) -> Result<Arc<dyn SocketTransport>, String>;
}

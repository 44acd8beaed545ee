//! Crate-wide error taxonomy.
//!
//! Every failure that can reach a caller is one of these variants. The
//! transport contract reports plain `String` reasons; the managers convert
//! them here at the boundary so callers never see raw transport errors.

use std::time::Duration;

/// Errors surfaced by the connection and channel managers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// No websocket endpoint could be resolved from the call, the stored
    /// config, or the environment. Fatal to the connect call; not retried.
    #[error("no websocket endpoint configured: {0}")]
    Configuration(String),

    /// The transport did not report itself connected within the window.
    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// A connect attempt is already in flight.
    #[error("a reconnect is already in progress")]
    ConnectInProgress,

    /// Transport-level failure during construction or close.
    #[error("transport error: {0}")]
    Transport(String),

    /// The reconnect attempt scheduled by poll-status recovery failed.
    #[error("recovery reconnect failed: {0}")]
    RecoveryFailed(String),

    /// A channel or listener cap was hit. Signals caller misuse; not retried.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Send or listen against a topic with no joined channel.
    #[error("no joined channel for topic '{0}'")]
    ChannelNotFound(String),

    /// The server rejected the join request.
    #[error("join rejected for '{topic}': {reason}")]
    Join { topic: String, reason: String },

    /// The join request was not acknowledged in time.
    #[error("join timed out for '{0}'")]
    JoinTimeout(String),

    /// The server rejected a pushed message.
    #[error("message rejected on '{topic}': {reason}")]
    Message { topic: String, reason: String },

    /// A pushed message was not acknowledged in time.
    #[error("message push timed out on '{0}'")]
    MessageTimeout(String),

    /// An operation that needs a live connection was called without one.
    #[error("not connected")]
    NotConnected,

    /// The global client was accessed before initialization.
    #[error("realtime client has not been initialized")]
    NotInitialized,
}

impl Error {
    /// True for the capacity-bound errors callers should treat as misuse.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::CapacityExceeded(_))
    }
}

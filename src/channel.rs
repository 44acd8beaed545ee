//! Per-topic channel lifecycle management.
//!
//! Owns the set of topics multiplexed over the connection: one channel
//! object per topic, bounded channel and listener registries, per-channel
//! message counters, and a pending-subscription queue for listeners
//! registered before their topic is joined.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout, Instant};

use crate::error::Error;
use crate::events::{ClientEvent, EventBus};
use crate::transport::{MessageCallback, PushStatus, SocketTransport, TopicChannel};

/// Maximum number of open channels. Each channel holds transport resources;
/// unbounded growth from caller misuse is a real leak vector.
pub const DEFAULT_MAX_CHANNELS: usize = 50;
/// Maximum listeners per (topic, event) pair.
pub const DEFAULT_MAX_LISTENERS_PER_EVENT: usize = 10;
/// Window for a join to be acknowledged.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Window for a pushed message to be acknowledged.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Step used when a second join call waits out an in-flight join.
const JOIN_WAIT_STEP: Duration = Duration::from_millis(50);

/// Channel status. Entries start at `Joining` on their first join attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Disconnected,
    Joining,
    Joined,
    Error,
}

/// Snapshot of one topic's lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelState {
    pub topic: String,
    pub status: ChannelStatus,
    pub error: Option<String>,
    pub last_joined: Option<DateTime<Utc>>,
    pub last_left: Option<DateTime<Utc>>,
    pub message_count: u64,
}

impl ChannelState {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            status: ChannelStatus::Joining,
            error: None,
            last_joined: None,
            last_left: None,
            message_count: 0,
        }
    }
}

/// Channel and listener counts for the resource-stats report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelResourceStats {
    pub channel_count: usize,
    pub max_channels: usize,
    pub listener_count: usize,
    pub max_listeners_per_event: usize,
    pub pending_subscriptions: usize,
}

struct ListenerEntry {
    callback: MessageCallback,
    transport_ref: u64,
}

struct PendingListener {
    event: String,
    callback: MessageCallback,
}

struct ChannelEntry {
    handle: Arc<dyn TopicChannel>,
    state: ChannelState,
    hooks_installed: bool,
}

struct Inner {
    socket: Option<Arc<dyn SocketTransport>>,
    channels: HashMap<String, ChannelEntry>,
    /// topic -> event -> listeners, bounded per event.
    listeners: HashMap<String, HashMap<String, Vec<ListenerEntry>>>,
    /// Subscriptions registered before their topic had a channel, flushed
    /// on that topic's next successful join.
    pending: HashMap<String, Vec<PendingListener>>,
}

/// Owns the per-topic channels multiplexed over the connection.
///
/// The socket reference is supplied and revoked by the connection manager's
/// transport-swap observer; this manager never owns it.
pub struct ChannelManager {
    events: Arc<EventBus>,
    max_channels: usize,
    max_listeners_per_event: usize,
    inner: Mutex<Inner>,
}

impl ChannelManager {
    pub fn new(events: Arc<EventBus>) -> Arc<Self> {
        Self::with_caps(events, DEFAULT_MAX_CHANNELS, DEFAULT_MAX_LISTENERS_PER_EVENT)
    }

    pub fn with_caps(
        events: Arc<EventBus>,
        max_channels: usize,
        max_listeners_per_event: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            events,
            max_channels,
            max_listeners_per_event,
            inner: Mutex::new(Inner {
                socket: None,
                channels: HashMap::new(),
                listeners: HashMap::new(),
                pending: HashMap::new(),
            }),
        })
    }

    /// Adopt a new socket reference after a (re)connect.
    pub fn set_socket(&self, socket: Arc<dyn SocketTransport>) {
        self.lock_inner().socket = Some(socket);
    }

    /// Drop the socket reference and every channel built on it. Called when
    /// the connection tears down underneath us; no graceful leaves.
    pub fn drop_socket(&self) {
        let topics = {
            let mut inner = self.lock_inner();
            inner.socket = None;
            inner.listeners.clear();
            inner.pending.clear();
            let topics: Vec<String> = inner.channels.keys().cloned().collect();
            inner.channels.clear();
            topics
        };
        for topic in topics {
            self.events
                .emit(ClientEvent::ChannelLeave, &json!({ "topic": topic }));
        }
    }

    /// Join a topic, or return the existing handle if already joined.
    ///
    /// At most one channel object exists per topic: a second call while the
    /// first is still pending waits it out and shares the same handle.
    pub async fn join_channel(
        self: &Arc<Self>,
        topic: &str,
        params: Value,
    ) -> Result<Arc<dyn TopicChannel>, Error> {
        enum Step {
            Done(Arc<dyn TopicChannel>),
            WaitInFlight(Arc<dyn TopicChannel>),
            Join(Arc<dyn TopicChannel>),
        }

        let step = {
            let mut inner = self.lock_inner();
            if let Some(entry) = inner.channels.get_mut(topic) {
                match entry.state.status {
                    ChannelStatus::Joined => Step::Done(entry.handle.clone()),
                    ChannelStatus::Joining => Step::WaitInFlight(entry.handle.clone()),
                    // Re-join a previously created channel object.
                    ChannelStatus::Disconnected | ChannelStatus::Error => {
                        entry.state.status = ChannelStatus::Joining;
                        Step::Join(entry.handle.clone())
                    }
                }
            } else {
                if inner.channels.len() >= self.max_channels {
                    return Err(Error::CapacityExceeded(format!(
                        "channel cap of {} reached",
                        self.max_channels
                    )));
                }
                let Some(socket) = &inner.socket else {
                    return Err(Error::NotConnected);
                };
                let handle = socket.channel(topic, params);
                inner.channels.insert(
                    topic.to_string(),
                    ChannelEntry {
                        handle: handle.clone(),
                        state: ChannelState::new(topic),
                        hooks_installed: false,
                    },
                );
                Step::Join(handle)
            }
        };

        match step {
            Step::Done(handle) => Ok(handle),
            Step::WaitInFlight(handle) => self.wait_for_join(topic, handle).await,
            Step::Join(handle) => {
                self.install_channel_hooks(topic, &handle);
                self.run_join(topic, handle).await
            }
        }
    }

    /// Wait out another caller's in-flight join and share its outcome.
    async fn wait_for_join(
        &self,
        topic: &str,
        handle: Arc<dyn TopicChannel>,
    ) -> Result<Arc<dyn TopicChannel>, Error> {
        let deadline = Instant::now() + JOIN_TIMEOUT;
        loop {
            sleep(JOIN_WAIT_STEP).await;
            let snapshot = {
                let inner = self.lock_inner();
                inner
                    .channels
                    .get(topic)
                    .map(|e| (e.state.status, e.state.error.clone()))
            };
            match snapshot {
                Some((ChannelStatus::Joined, _)) => return Ok(handle),
                Some((ChannelStatus::Joining, _)) => {
                    if Instant::now() >= deadline {
                        return Err(Error::JoinTimeout(topic.to_string()));
                    }
                }
                Some((ChannelStatus::Error, error)) => {
                    return Err(Error::Join {
                        topic: topic.to_string(),
                        reason: error.unwrap_or_else(|| "join failed".to_string()),
                    });
                }
                Some((ChannelStatus::Disconnected, _)) | None => {
                    return Err(Error::ChannelNotFound(topic.to_string()));
                }
            }
        }
    }

    /// Issue the join request and settle the channel state on its outcome.
    async fn run_join(
        &self,
        topic: &str,
        handle: Arc<dyn TopicChannel>,
    ) -> Result<Arc<dyn TopicChannel>, Error> {
        tracing::info!(topic, "joining channel");

        match timeout(JOIN_TIMEOUT, handle.join()).await {
            Ok(PushStatus::Ok(_resp)) => {
                let pending = {
                    let mut inner = self.lock_inner();
                    match inner.channels.get_mut(topic) {
                        Some(entry) => {
                            entry.state.status = ChannelStatus::Joined;
                            entry.state.last_joined = Some(Utc::now());
                            entry.state.error = None;
                        }
                        // The topic was left while the ack was pending; the
                        // entry is gone and this join no longer counts.
                        None => return Err(Error::ChannelNotFound(topic.to_string())),
                    }
                    inner.pending.remove(topic)
                };
                tracing::info!(topic, "channel joined");
                self.events
                    .emit(ClientEvent::ChannelJoin, &json!({ "topic": topic }));

                if let Some(pending) = pending {
                    for listener in pending {
                        if let Err(e) =
                            self.register_listener(topic, &listener.event, listener.callback)
                        {
                            tracing::warn!(
                                topic,
                                event = %listener.event,
                                error = %e,
                                "dropping queued subscription"
                            );
                        }
                    }
                }
                Ok(handle)
            }
            Ok(PushStatus::Error(reply)) => {
                let reason = reply.to_string();
                self.fail_channel(topic, &reason);
                Err(Error::Join {
                    topic: topic.to_string(),
                    reason,
                })
            }
            Ok(PushStatus::Timeout) | Err(_) => {
                self.fail_channel(topic, "join timed out");
                Err(Error::JoinTimeout(topic.to_string()))
            }
        }
    }

    fn fail_channel(&self, topic: &str, reason: &str) {
        {
            let mut inner = self.lock_inner();
            match inner.channels.get_mut(topic) {
                Some(entry) => {
                    entry.state.status = ChannelStatus::Error;
                    entry.state.error = Some(reason.to_string());
                }
                // Left while the ack was pending; nothing to report against.
                None => return,
            }
        }
        tracing::error!(topic, reason, "channel join failed");
        self.events.emit(
            ClientEvent::ChannelError,
            &json!({ "topic": topic, "reason": reason }),
        );
    }

    /// Leave a topic, removing its channel and listeners. No-op if absent.
    pub async fn leave_channel(&self, topic: &str) {
        let (removed, listeners) = {
            let mut inner = self.lock_inner();
            inner.pending.remove(topic);
            (inner.channels.remove(topic), inner.listeners.remove(topic))
        };
        let Some(mut entry) = removed else {
            return;
        };

        // Detach transport-level listeners so a stale handle cannot fire
        // for messages that arrive before a rejoin.
        if let Some(by_event) = listeners {
            for (event, list) in by_event {
                for listener in list {
                    entry.handle.off(&event, listener.transport_ref);
                }
            }
        }

        match entry.handle.leave().await {
            PushStatus::Ok(_) => {}
            PushStatus::Error(reply) => {
                tracing::warn!(topic, reply = %reply, "error while leaving channel (ignored)");
            }
            PushStatus::Timeout => {
                tracing::warn!(topic, "leave was not acknowledged (ignored)");
            }
        }

        entry.state.status = ChannelStatus::Disconnected;
        entry.state.last_left = Some(Utc::now());
        tracing::info!(topic, "channel left");
        self.events
            .emit(ClientEvent::ChannelLeave, &json!({ "topic": topic }));
    }

    /// Push a message on a joined topic and await acknowledgment.
    pub async fn send_message(
        &self,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> Result<Value, Error> {
        let handle = {
            let inner = self.lock_inner();
            match inner.channels.get(topic) {
                Some(entry) if entry.state.status == ChannelStatus::Joined => entry.handle.clone(),
                _ => return Err(Error::ChannelNotFound(topic.to_string())),
            }
        };

        let push_ref = uuid::Uuid::new_v4().to_string();
        tracing::debug!(topic, event, push_ref = %push_ref, "pushing message");

        match timeout(PUSH_TIMEOUT, handle.push(event, payload, &push_ref)).await {
            Ok(PushStatus::Ok(response)) => {
                let mut inner = self.lock_inner();
                if let Some(entry) = inner.channels.get_mut(topic) {
                    entry.state.message_count += 1;
                }
                Ok(response)
            }
            Ok(PushStatus::Error(reply)) => Err(Error::Message {
                topic: topic.to_string(),
                reason: reply.to_string(),
            }),
            Ok(PushStatus::Timeout) | Err(_) => Err(Error::MessageTimeout(topic.to_string())),
        }
    }

    /// Register a message listener for a (topic, event) pair.
    ///
    /// Duplicate registration of the same callback is a no-op. A topic with
    /// no active channel queues the subscription until the topic's next
    /// successful join rather than failing.
    pub fn on_message(&self, topic: &str, event: &str, cb: MessageCallback) -> Result<(), Error> {
        {
            let mut inner = self.lock_inner();
            if !inner.channels.contains_key(topic) {
                let pending = inner.pending.entry(topic.to_string()).or_default();
                let duplicate = pending
                    .iter()
                    .any(|p| p.event == event && Arc::ptr_eq(&p.callback, &cb));
                if duplicate {
                    return Ok(());
                }
                // The queue is bounded by the same per-event cap as the live
                // registry, so a not-yet-joined topic cannot grow without
                // bound either.
                let queued = pending.iter().filter(|p| p.event == event).count();
                if queued >= self.max_listeners_per_event {
                    tracing::warn!(
                        topic,
                        event,
                        cap = self.max_listeners_per_event,
                        "listener cap reached in pending queue, dropping registration"
                    );
                    return Err(Error::CapacityExceeded(format!(
                        "listener cap of {} reached for '{}' on '{}'",
                        self.max_listeners_per_event, event, topic
                    )));
                }
                tracing::warn!(topic, event, "no active channel, queueing subscription");
                pending.push(PendingListener {
                    event: event.to_string(),
                    callback: cb,
                });
                return Ok(());
            }
        }
        self.register_listener(topic, event, cb)
    }

    fn register_listener(&self, topic: &str, event: &str, cb: MessageCallback) -> Result<(), Error> {
        let mut inner = self.lock_inner();
        let handle = match inner.channels.get(topic) {
            Some(entry) => entry.handle.clone(),
            None => return Err(Error::ChannelNotFound(topic.to_string())),
        };

        let by_event = inner
            .listeners
            .entry(topic.to_string())
            .or_default()
            .entry(event.to_string())
            .or_default();

        if by_event.iter().any(|l| Arc::ptr_eq(&l.callback, &cb)) {
            return Ok(());
        }
        if by_event.len() >= self.max_listeners_per_event {
            tracing::warn!(
                topic,
                event,
                cap = self.max_listeners_per_event,
                "listener cap reached, dropping registration"
            );
            return Err(Error::CapacityExceeded(format!(
                "listener cap of {} reached for '{}' on '{}'",
                self.max_listeners_per_event, event, topic
            )));
        }

        let transport_ref = handle.on(event, cb.clone());
        by_event.push(ListenerEntry {
            callback: cb,
            transport_ref,
        });
        Ok(())
    }

    /// Remove a listener, its transport registration, and any now-empty
    /// registry entries. Matching queued subscriptions are removed too.
    pub fn off_message(&self, topic: &str, event: &str, cb: &MessageCallback) {
        let mut inner = self.lock_inner();

        if let Some(pending) = inner.pending.get_mut(topic) {
            pending.retain(|p| !(p.event == event && Arc::ptr_eq(&p.callback, cb)));
            if pending.is_empty() {
                inner.pending.remove(topic);
            }
        }

        let handle = inner.channels.get(topic).map(|e| e.handle.clone());
        let mut removed_ref = None;

        if let Some(by_topic) = inner.listeners.get_mut(topic) {
            if let Some(list) = by_topic.get_mut(event) {
                if let Some(pos) = list.iter().position(|l| Arc::ptr_eq(&l.callback, cb)) {
                    removed_ref = Some(list.remove(pos).transport_ref);
                }
                if list.is_empty() {
                    by_topic.remove(event);
                }
            }
            if by_topic.is_empty() {
                inner.listeners.remove(topic);
            }
        }
        drop(inner);

        if let (Some(handle), Some(listener_ref)) = (handle, removed_ref) {
            handle.off(event, listener_ref);
        }
    }

    /// Snapshot of one topic's state.
    pub fn get_channel_state(&self, topic: &str) -> Option<ChannelState> {
        self.lock_inner()
            .channels
            .get(topic)
            .map(|e| e.state.clone())
    }

    /// Snapshots of every tracked topic.
    pub fn get_all_channel_states(&self) -> Vec<ChannelState> {
        self.lock_inner()
            .channels
            .values()
            .map(|e| e.state.clone())
            .collect()
    }

    pub fn get_channel_count(&self) -> usize {
        self.lock_inner().channels.len()
    }

    pub fn get_resource_stats(&self) -> ChannelResourceStats {
        let inner = self.lock_inner();
        ChannelResourceStats {
            channel_count: inner.channels.len(),
            max_channels: self.max_channels,
            listener_count: inner
                .listeners
                .values()
                .flat_map(|by_event| by_event.values())
                .map(Vec::len)
                .sum(),
            max_listeners_per_event: self.max_listeners_per_event,
            pending_subscriptions: inner.pending.values().map(Vec::len).sum(),
        }
    }

    /// Leave every channel and clear all registries. Called on full
    /// disconnect, before the connection releases the transport.
    pub async fn cleanup(&self) {
        let topics: Vec<String> = self.lock_inner().channels.keys().cloned().collect();
        for topic in topics {
            self.leave_channel(&topic).await;
        }
        let mut inner = self.lock_inner();
        inner.listeners.clear();
        inner.pending.clear();
        inner.socket = None;
    }

    // ------------------------------------------------------------------

    /// Install error/close hooks exactly once per channel object, so
    /// repeated join calls never double-install.
    fn install_channel_hooks(self: &Arc<Self>, topic: &str, handle: &Arc<dyn TopicChannel>) {
        {
            let mut inner = self.lock_inner();
            match inner.channels.get_mut(topic) {
                Some(entry) if !entry.hooks_installed => entry.hooks_installed = true,
                _ => return,
            }
        }

        let mgr: Weak<Self> = Arc::downgrade(self);
        let topic_owned = topic.to_string();
        handle.on_error(Box::new(move |text| {
            if let Some(mgr) = mgr.upgrade() {
                mgr.on_channel_error(&topic_owned, text);
            }
        }));

        let mgr: Weak<Self> = Arc::downgrade(self);
        let topic_owned = topic.to_string();
        handle.on_close(Box::new(move || {
            if let Some(mgr) = mgr.upgrade() {
                mgr.on_channel_close(&topic_owned);
            }
        }));
    }

    fn on_channel_error(&self, topic: &str, text: &str) {
        {
            let mut inner = self.lock_inner();
            if let Some(entry) = inner.channels.get_mut(topic) {
                entry.state.status = ChannelStatus::Error;
                entry.state.error = Some(text.to_string());
            }
        }
        tracing::error!(topic, error = %text, "channel error");
        self.events.emit(
            ClientEvent::ChannelError,
            &json!({ "topic": topic, "reason": text }),
        );
    }

    fn on_channel_close(&self, topic: &str) {
        let mut inner = self.lock_inner();
        if let Some(entry) = inner.channels.get_mut(topic) {
            if entry.state.status != ChannelStatus::Disconnected {
                entry.state.status = ChannelStatus::Disconnected;
                entry.state.last_left = Some(Utc::now());
            }
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_channel_state_starts_joining() {
        let state = ChannelState::new("room:lobby");
        assert_eq!(state.topic, "room:lobby");
        assert_eq!(state.status, ChannelStatus::Joining);
        assert_eq!(state.message_count, 0);
        assert!(state.error.is_none());
    }

    #[test]
    fn empty_manager_reports_empty_stats() {
        let manager = ChannelManager::new(Arc::new(EventBus::new()));
        let stats = manager.get_resource_stats();
        assert_eq!(stats.channel_count, 0);
        assert_eq!(stats.listener_count, 0);
        assert_eq!(stats.pending_subscriptions, 0);
        assert_eq!(stats.max_channels, DEFAULT_MAX_CHANNELS);
        assert_eq!(
            stats.max_listeners_per_event,
            DEFAULT_MAX_LISTENERS_PER_EVENT
        );
    }

    #[tokio::test]
    async fn join_without_socket_is_not_connected() {
        let manager = ChannelManager::new(Arc::new(EventBus::new()));
        let err = manager
            .join_channel("room:lobby", serde_json::json!({}))
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[test]
    fn on_message_without_channel_queues() {
        let manager = ChannelManager::new(Arc::new(EventBus::new()));
        let cb: MessageCallback = Arc::new(|_| {});
        manager.on_message("room:lobby", "msg", cb.clone()).unwrap();
        assert_eq!(manager.get_resource_stats().pending_subscriptions, 1);

        // queued duplicate is a no-op
        manager.on_message("room:lobby", "msg", cb.clone()).unwrap();
        assert_eq!(manager.get_resource_stats().pending_subscriptions, 1);

        manager.off_message("room:lobby", "msg", &cb);
        assert_eq!(manager.get_resource_stats().pending_subscriptions, 0);
    }
}

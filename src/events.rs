//! Bounded pub/sub bus for client lifecycle events.
//!
//! Subscriber counts are capped per event so a leaky caller cannot grow the
//! registry without bound; over-cap registrations are dropped with a warning,
//! never queued.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// Default per-event subscriber cap.
pub const DEFAULT_MAX_LISTENERS_PER_EVENT: usize = 20;

/// Lifecycle events observable by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    Connect,
    Disconnect,
    Error,
    Reconnect,
    ChannelJoin,
    ChannelLeave,
    ChannelError,
}

impl ClientEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientEvent::Connect => "connect",
            ClientEvent::Disconnect => "disconnect",
            ClientEvent::Error => "error",
            ClientEvent::Reconnect => "reconnect",
            ClientEvent::ChannelJoin => "channel_join",
            ClientEvent::ChannelLeave => "channel_leave",
            ClientEvent::ChannelError => "channel_error",
        }
    }
}

impl std::fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handler invoked with the event payload. Identity (the `Arc` pointer) is
/// used for de-duplication and removal.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Listener counts reported for leak detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBusStats {
    pub total_listeners: usize,
    pub max_per_event: usize,
    pub events_with_listeners: usize,
}

/// Synchronous pub/sub bus over [`ClientEvent`].
pub struct EventBus {
    handlers: Mutex<HashMap<ClientEvent, Vec<EventHandler>>>,
    max_per_event: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_MAX_LISTENERS_PER_EVENT)
    }

    pub fn with_cap(max_per_event: usize) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            max_per_event,
        }
    }

    /// Register a handler. Returns `false` if the handler was already
    /// registered or the per-event cap is hit (dropped with a warning).
    pub fn on(&self, event: ClientEvent, handler: EventHandler) -> bool {
        let mut handlers = match self.handlers.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = handlers.entry(event).or_default();

        if entry.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return false;
        }
        if entry.len() >= self.max_per_event {
            tracing::warn!(
                event = %event,
                cap = self.max_per_event,
                "event listener cap reached, dropping registration"
            );
            return false;
        }
        entry.push(handler);
        true
    }

    /// Remove a handler by identity, pruning empty entries.
    pub fn off(&self, event: ClientEvent, handler: &EventHandler) {
        let mut handlers = match self.handlers.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = handlers.get_mut(&event) {
            entry.retain(|h| !Arc::ptr_eq(h, handler));
            if entry.is_empty() {
                handlers.remove(&event);
            }
        }
    }

    /// Invoke all handlers for an event, in registration order. A panicking
    /// handler is logged and isolated so the rest still run and the emitter
    /// never sees it.
    pub fn emit(&self, event: ClientEvent, data: &Value) {
        let snapshot: Vec<EventHandler> = {
            let handlers = match self.handlers.lock() {
                Ok(h) => h,
                Err(poisoned) => poisoned.into_inner(),
            };
            handlers.get(&event).cloned().unwrap_or_default()
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
                tracing::error!(event = %event, "event handler panicked");
            }
        }
    }

    /// Listener counts for the resource-stats report.
    pub fn stats(&self) -> EventBusStats {
        let handlers = match self.handlers.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        EventBusStats {
            total_listeners: handlers.values().map(Vec::len).sum(),
            max_per_event: self.max_per_event,
            events_with_listeners: handlers.values().filter(|v| !v.is_empty()).count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            bus.on(
                ClientEvent::Connect,
                Arc::new(move |_| order.lock().unwrap().push(i)),
            );
        }
        bus.emit(ClientEvent::Connect, &json!({}));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn duplicate_registration_is_a_noop() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(count.clone());

        assert!(bus.on(ClientEvent::Connect, handler.clone()));
        assert!(!bus.on(ClientEvent::Connect, handler));

        bus.emit(ClientEvent::Connect, &json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn over_cap_registration_is_dropped() {
        let bus = EventBus::with_cap(2);
        let count = Arc::new(AtomicUsize::new(0));

        assert!(bus.on(ClientEvent::Error, counting_handler(count.clone())));
        assert!(bus.on(ClientEvent::Error, counting_handler(count.clone())));
        let dropped = counting_handler(count.clone());
        assert!(!bus.on(ClientEvent::Error, dropped));

        bus.emit(ClientEvent::Error, &json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.on(ClientEvent::Disconnect, Arc::new(|_| panic!("boom")));
        bus.on(ClientEvent::Disconnect, counting_handler(count.clone()));

        bus.emit(ClientEvent::Disconnect, &json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_and_prunes() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(count.clone());

        bus.on(ClientEvent::Reconnect, handler.clone());
        bus.off(ClientEvent::Reconnect, &handler);
        bus.emit(ClientEvent::Reconnect, &json!({}));

        assert_eq!(count.load(Ordering::SeqCst), 0);
        let stats = bus.stats();
        assert_eq!(stats.total_listeners, 0);
        assert_eq!(stats.events_with_listeners, 0);
    }

    #[test]
    fn stats_count_distinct_events() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.on(ClientEvent::Connect, counting_handler(count.clone()));
        bus.on(ClientEvent::Connect, counting_handler(count.clone()));
        bus.on(ClientEvent::ChannelJoin, counting_handler(count));

        let stats = bus.stats();
        assert_eq!(stats.total_listeners, 3);
        assert_eq!(stats.events_with_listeners, 2);
        assert_eq!(stats.max_per_event, DEFAULT_MAX_LISTENERS_PER_EVENT);
    }
}

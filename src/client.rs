//! Client facade composing the connection manager, channel manager, and
//! event bus, plus the explicit process-wide singleton registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::channel::{ChannelManager, ChannelResourceStats, ChannelState};
use crate::config::{ConfigUpdate, ConnectionParams, EnvConfig, PhoenixConfig};
use crate::connection::{ConnectionManager, ConnectionState, ConnectionStatus};
use crate::error::Error;
use crate::events::{ClientEvent, EventBus, EventBusStats, EventHandler};
use crate::storage::StorageAdapter;
use crate::transport::{MessageCallback, SocketTransport, TopicChannel, TransportFactory};

/// Aggregate resource accounting across the managers and the event bus.
#[derive(Debug, Clone, Copy)]
pub struct ResourceStats {
    pub channels: ChannelResourceStats,
    pub events: EventBusStats,
}

/// One logical connection plus its multiplexed channels.
///
/// Thin composition layer: everything stateful lives in the managers. The
/// facade's one job beyond delegation is ordering — on disconnect the
/// channel manager drops its transport reference before the connection
/// manager releases the handle.
pub struct RealtimeClient {
    connection: Arc<ConnectionManager>,
    channels: Arc<ChannelManager>,
    events: Arc<EventBus>,
}

impl RealtimeClient {
    /// Build a client over a transport factory and storage backend.
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        storage: Arc<dyn StorageAdapter>,
        env: EnvConfig,
    ) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let connection = ConnectionManager::new(factory, storage, events.clone(), env);
        let channels = ChannelManager::new(events.clone());

        let channels_for_swap = channels.clone();
        connection.set_swap_observer(Box::new(move |transport| match transport {
            Some(t) => channels_for_swap.set_socket(t),
            None => channels_for_swap.drop_socket(),
        }));

        Arc::new(Self {
            connection,
            channels,
            events,
        })
    }

    // ------------------------------------------------------------------
    // Connection
    // ------------------------------------------------------------------

    pub async fn connect(
        &self,
        params: ConnectionParams,
    ) -> Result<Arc<dyn SocketTransport>, Error> {
        self.connection.connect(params).await
    }

    pub async fn disconnect(&self, reason: Option<&str>) {
        // Graceful channel teardown first, while the transport is still up.
        self.channels.cleanup().await;
        self.connection.disconnect(reason).await;
    }

    pub async fn reset_connection(&self) {
        self.channels.cleanup().await;
        self.connection.reset().await;
    }

    pub async fn force_reconnect(&self) -> Result<(), Error> {
        self.connection.force_reconnect().await
    }

    pub fn get_connection_state(&self) -> ConnectionState {
        self.connection.get_state()
    }

    pub fn get_connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn can_connect(&self) -> bool {
        self.connection.can_connect()
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    pub async fn join_channel(
        &self,
        topic: &str,
        params: Value,
    ) -> Result<Arc<dyn TopicChannel>, Error> {
        self.channels.join_channel(topic, params).await
    }

    pub async fn leave_channel(&self, topic: &str) {
        self.channels.leave_channel(topic).await;
    }

    pub async fn send_message(
        &self,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> Result<Value, Error> {
        self.channels.send_message(topic, event, payload).await
    }

    pub fn on_message(&self, topic: &str, event: &str, cb: MessageCallback) -> Result<(), Error> {
        self.channels.on_message(topic, event, cb)
    }

    pub fn off_message(&self, topic: &str, event: &str, cb: &MessageCallback) {
        self.channels.off_message(topic, event, cb);
    }

    pub fn get_channel_state(&self, topic: &str) -> Option<ChannelState> {
        self.channels.get_channel_state(topic)
    }

    pub fn get_all_channel_states(&self) -> Vec<ChannelState> {
        self.channels.get_all_channel_states()
    }

    pub fn get_channel_count(&self) -> usize {
        self.channels.get_channel_count()
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn set_websocket_url(&self, url: Option<String>) -> PhoenixConfig {
        self.connection.update_config(ConfigUpdate {
            url: Some(url),
            ..Default::default()
        })
    }

    pub fn set_auth_params(&self, params: Option<BTreeMap<String, Value>>) -> PhoenixConfig {
        self.connection.update_config(ConfigUpdate {
            auth_params: Some(params),
            ..Default::default()
        })
    }

    pub fn set_long_poll_support(&self, enabled: bool) -> PhoenixConfig {
        self.connection.update_config(ConfigUpdate {
            use_long_poll: Some(enabled),
            ..Default::default()
        })
    }

    pub fn disable_long_poll_fallback(&self, disabled: bool) -> PhoenixConfig {
        self.connection.update_config(ConfigUpdate {
            disable_long_poll_fallback: Some(disabled),
            ..Default::default()
        })
    }

    pub fn get_config(&self) -> PhoenixConfig {
        self.connection.get_config()
    }

    pub fn clear_config(&self) {
        self.connection.clear_config();
    }

    // ------------------------------------------------------------------
    // Events and accounting
    // ------------------------------------------------------------------

    /// Register a lifecycle event handler. Returns `false` when the
    /// registration was dropped (duplicate or over the cap).
    pub fn add_event_listener(&self, event: ClientEvent, handler: EventHandler) -> bool {
        self.events.on(event, handler)
    }

    pub fn remove_event_listener(&self, event: ClientEvent, handler: &EventHandler) {
        self.events.off(event, handler);
    }

    pub fn get_resource_stats(&self) -> ResourceStats {
        ResourceStats {
            channels: self.channels.get_resource_stats(),
            events: self.events.stats(),
        }
    }
}

// ----------------------------------------------------------------------
// Process-wide singleton registry
// ----------------------------------------------------------------------

static GLOBAL_CLIENT: OnceCell<Arc<RealtimeClient>> = OnceCell::new();

/// Register the process-wide client. Idempotent: the first registration
/// wins and later calls return it unchanged.
pub fn init_global(client: Arc<RealtimeClient>) -> Arc<RealtimeClient> {
    GLOBAL_CLIENT.get_or_init(|| client).clone()
}

/// The process-wide client. Fails loudly before [`init_global`] has run.
pub fn global() -> Result<Arc<RealtimeClient>, Error> {
    GLOBAL_CLIENT.get().cloned().ok_or(Error::NotInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::transport::ReconnectDelayFn;
    use async_trait::async_trait;

    struct NeverFactory;

    #[async_trait]
    impl TransportFactory for NeverFactory {
        async fn connect(
            &self,
            _url: &str,
            _params: Value,
            _reconnect_delay: ReconnectDelayFn,
        ) -> Result<Arc<dyn SocketTransport>, String> {
            Err("unreachable in this test".to_string())
        }
    }

    fn test_client() -> Arc<RealtimeClient> {
        RealtimeClient::new(
            Arc::new(NeverFactory),
            Arc::new(MemoryStorage::new()),
            EnvConfig::default(),
        )
    }

    // Registry behavior is order-sensitive, so one test covers the whole
    // before/init/after sequence.
    #[test]
    fn global_registry_is_explicit_and_idempotent() {
        assert!(matches!(global(), Err(Error::NotInitialized)));

        let first = init_global(test_client());
        assert!(Arc::ptr_eq(&first, &global().unwrap()));

        let second = init_global(test_client());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn fresh_client_starts_disconnected() {
        let client = test_client();
        assert_eq!(
            client.get_connection_status(),
            ConnectionStatus::Disconnected
        );
        assert!(client.can_connect());
        assert!(!client.is_connected());
        assert_eq!(client.get_channel_count(), 0);
    }
}

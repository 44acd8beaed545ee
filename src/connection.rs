//! Connection lifecycle management.
//!
//! Owns the single transport connection: drives its state machine, computes
//! reconnect backoff, persists and restores connection parameters, and runs
//! the dedicated recovery path for the long-poll "poll status" fault.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, timeout, Instant};

use crate::config::{
    build_query_string, resolve_socket_url, ConfigUpdate, ConnectionParams, EnvConfig,
    PhoenixConfig, CONFIG_STORAGE_KEY, PARAMS_STORAGE_KEY,
};
use crate::error::Error;
use crate::events::{ClientEvent, EventBus};
use crate::fault;
use crate::storage::{self, StorageAdapter};
use crate::transport::{ReconnectDelayFn, SocketTransport, TransportFactory};

/// Minimum spacing between force-reconnect cycles.
pub const FORCE_RECONNECT_WINDOW: Duration = Duration::from_secs(5);
/// Settle delay between the disconnect and reconnect of a forced cycle.
pub const FORCE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Delay before the reconnect scheduled by poll-status recovery.
pub const RECOVERY_DELAY: Duration = Duration::from_secs(2);

/// Connection status. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the connection lifecycle. Lives for the process; reset-only.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    pub error: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            last_connected: None,
            last_disconnected: None,
            reconnect_attempts: 0,
            error: None,
        }
    }
}

/// Capped exponential backoff consulted by the transport between its own
/// retry attempts: attempt 1 waits `initial`, doubling up to `max`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay for a given attempt number (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.initial.saturating_mul(1u32 << exponent);
        delay.min(self.max)
    }

    /// Wrap the policy as the delay function handed to the transport.
    pub fn delay_fn(&self) -> ReconnectDelayFn {
        let policy = self.clone();
        Arc::new(move |attempt| policy.delay_for_attempt(attempt))
    }
}

/// Observer invoked when the transport handle changes: `Some` on connect,
/// `None` before the handle is released. The channel manager hooks in here
/// so it never outlives the connection it multiplexes over.
pub type TransportSwapObserver = Box<dyn Fn(Option<Arc<dyn SocketTransport>>) + Send + Sync>;

struct Inner {
    state: ConnectionState,
    config: PhoenixConfig,
    last_params: Option<ConnectionParams>,
    transport: Option<Arc<dyn SocketTransport>>,
    /// Set while a manual disconnect is closing the transport, so the close
    /// callback does not treat it as a drop.
    closing: bool,
}

/// Owns the single transport connection and its state machine.
pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    storage: Arc<dyn StorageAdapter>,
    events: Arc<EventBus>,
    env: EnvConfig,
    backoff: BackoffPolicy,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<ConnectionStatus>,
    open_notify: Arc<Notify>,
    last_force_reconnect: Mutex<Option<Instant>>,
    swap_observer: Mutex<Option<TransportSwapObserver>>,
}

impl ConnectionManager {
    /// Build a manager, restoring persisted config and connection params.
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        storage: Arc<dyn StorageAdapter>,
        events: Arc<EventBus>,
        env: EnvConfig,
    ) -> Arc<Self> {
        let config: PhoenixConfig =
            storage::load(&*storage, CONFIG_STORAGE_KEY).unwrap_or_default();
        let last_params: Option<ConnectionParams> = storage::load(&*storage, PARAMS_STORAGE_KEY);

        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);

        Arc::new(Self {
            factory,
            storage,
            events,
            env,
            backoff: BackoffPolicy::default(),
            inner: Mutex::new(Inner {
                state: ConnectionState::default(),
                config,
                last_params,
                transport: None,
                closing: false,
            }),
            status_tx,
            open_notify: Arc::new(Notify::new()),
            last_force_reconnect: Mutex::new(None),
            swap_observer: Mutex::new(None),
        })
    }

    /// Register the transport-swap observer. One observer; the facade wires
    /// the channel manager in here.
    pub fn set_swap_observer(&self, observer: TransportSwapObserver) {
        *lock_plain(&self.swap_observer) = Some(observer);
    }

    /// Connect, or return the live handle when nothing changed.
    ///
    /// Parameters are merged over the last-used set (new scalars win, the
    /// `params` map is shallow-merged). A changed effective parameter set on
    /// a live connection forces disconnect-then-reconnect; an in-flight
    /// attempt is awaited rather than raced.
    pub async fn connect(
        self: &Arc<Self>,
        params: ConnectionParams,
    ) -> Result<Arc<dyn SocketTransport>, Error> {
        self.ensure_fault_guard();

        let effective = {
            let inner = self.lock_inner();
            match &inner.last_params {
                Some(last) => last.merged_with(&params),
                None => params.clone(),
            }
        };

        enum Action {
            ReturnHandle(Arc<dyn SocketTransport>),
            Reconnect,
            WaitInFlight,
            Attempt,
        }

        loop {
            let action = {
                let mut inner = self.lock_inner();
                match inner.state.status {
                    ConnectionStatus::Connected => match &inner.transport {
                        Some(t)
                            if inner.last_params.as_ref() == Some(&effective)
                                && t.is_connected() =>
                        {
                            Action::ReturnHandle(t.clone())
                        }
                        Some(_) => Action::Reconnect,
                        // Status drifted from the transport; correct it.
                        None => {
                            self.set_status(&mut inner, ConnectionStatus::Connecting);
                            Action::Attempt
                        }
                    },
                    ConnectionStatus::Connecting => Action::WaitInFlight,
                    ConnectionStatus::Reconnecting => return Err(Error::ConnectInProgress),
                    ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                        self.set_status(&mut inner, ConnectionStatus::Connecting);
                        Action::Attempt
                    }
                }
            };

            match action {
                Action::ReturnHandle(transport) => return Ok(transport),
                Action::Reconnect => {
                    tracing::info!("connection parameters changed, reconnecting");
                    self.disconnect(Some("parameters changed")).await;
                }
                Action::WaitInFlight => return self.await_in_flight().await,
                Action::Attempt => return self.attempt_connect(effective, true).await,
            }
        }
    }

    /// Wait out another caller's in-flight attempt and share its outcome.
    async fn await_in_flight(&self) -> Result<Arc<dyn SocketTransport>, Error> {
        let mut rx = self.status_tx.subscribe();
        while *rx.borrow() == ConnectionStatus::Connecting {
            if rx.changed().await.is_err() {
                break;
            }
        }
        let inner = self.lock_inner();
        match (&inner.state.status, &inner.transport) {
            (ConnectionStatus::Connected, Some(t)) => Ok(t.clone()),
            _ => Err(Error::Transport(
                inner
                    .state
                    .error
                    .clone()
                    .unwrap_or_else(|| "connect attempt failed".to_string()),
            )),
        }
    }

    /// Run one connect attempt. Caller has already moved status to
    /// `Connecting`. `count_failures` is false on the recovery path, which
    /// must not disturb the normal backoff counters or report its failure
    /// through the generic error event.
    async fn attempt_connect(
        self: &Arc<Self>,
        effective: ConnectionParams,
        count_failures: bool,
    ) -> Result<Arc<dyn SocketTransport>, Error> {
        let config = self.lock_inner().config.clone();

        let url = match resolve_socket_url(&effective, &config, &self.env) {
            Ok(url) => url,
            Err(e) => {
                // Caller misconfiguration, not a transport failure: no
                // counter bump and no automatic retry.
                let mut inner = self.lock_inner();
                inner.state.error = Some(e.to_string());
                self.set_status(&mut inner, ConnectionStatus::Error);
                return Err(e);
            }
        };

        let query = build_query_string(&effective, &config);
        let full_url = if query.is_empty() {
            url.clone()
        } else {
            format!("{}?{}", url, query)
        };

        let mut connect_params = serde_json::Map::new();
        if let Some(p) = &effective.params {
            for (k, v) in p {
                connect_params.insert(k.clone(), v.clone());
            }
        }
        let transport_params = json!({
            "params": Value::Object(connect_params),
            "long_poll": config.use_long_poll && !config.disable_long_poll_fallback,
        });

        tracing::info!(url = %url, "connecting");

        let transport = match self
            .factory
            .connect(&full_url, transport_params, self.backoff.delay_fn())
            .await
        {
            Ok(t) => t,
            Err(reason) => {
                self.record_connect_failure(&reason, count_failures);
                return Err(Error::Transport(reason));
            }
        };

        self.install_socket_hooks(&transport);

        // Wait, bounded, for the transport to self-report connected.
        let window = effective.connect_timeout();
        let deadline = Instant::now() + window;
        while !transport.is_connected() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || timeout(remaining, self.open_notify.notified()).await.is_err()
            {
                if transport.is_connected() {
                    break;
                }
                let _ = transport.close().await;
                let reason = format!("transport did not open within {:?}", window);
                self.record_connect_failure(&reason, count_failures);
                return Err(Error::ConnectTimeout(window));
            }
        }

        {
            let mut inner = self.lock_inner();
            inner.transport = Some(transport.clone());
            inner.state.last_connected = Some(Utc::now());
            inner.state.reconnect_attempts = 0;
            inner.state.error = None;
            inner.last_params = Some(effective.clone());
            self.set_status(&mut inner, ConnectionStatus::Connected);
        }
        storage::save(&*self.storage, PARAMS_STORAGE_KEY, &effective.persistable());
        self.notify_swap(Some(transport.clone()));
        self.events.emit(ClientEvent::Connect, &json!({ "url": url }));
        tracing::info!(url = %url, "connected");

        Ok(transport)
    }

    fn record_connect_failure(&self, reason: &str, count_failures: bool) {
        {
            let mut inner = self.lock_inner();
            if count_failures {
                inner.state.reconnect_attempts += 1;
            }
            inner.state.error = Some(reason.to_string());
            self.set_status(&mut inner, ConnectionStatus::Error);
        }
        tracing::error!(reason = %reason, "connect attempt failed");
        // The recovery path reports its own failure as `RecoveryFailed`;
        // emitting here as well would surface the same failure twice.
        if count_failures {
            self.events.emit(
                ClientEvent::Error,
                &json!({ "scope": "connection", "reason": reason }),
            );
        }
    }

    /// Gracefully close and release the transport. No-op without one.
    pub async fn disconnect(&self, reason: Option<&str>) {
        let transport = {
            let mut inner = self.lock_inner();
            if inner.transport.is_none() {
                return;
            }
            inner.closing = true;
            inner.transport.take()
        };

        // The channel manager drops its reference before the handle goes.
        self.notify_swap(None);

        if let Some(t) = transport {
            if let Err(e) = t.close().await {
                tracing::warn!(error = %e, "error while closing transport (ignored)");
            }
        }

        {
            let mut inner = self.lock_inner();
            inner.closing = false;
            inner.state.last_disconnected = Some(Utc::now());
            self.set_status(&mut inner, ConnectionStatus::Disconnected);
        }
        tracing::info!(reason = reason.unwrap_or("unspecified"), "disconnected");
        self.events
            .emit(ClientEvent::Disconnect, &json!({ "reason": reason }));
    }

    /// Tear down and reconnect with the last stored params.
    ///
    /// Throttled: a second call within [`FORCE_RECONNECT_WINDOW`] is dropped
    /// with a warning.
    pub async fn force_reconnect(self: &Arc<Self>) -> Result<(), Error> {
        {
            let mut last = lock_plain(&self.last_force_reconnect);
            if let Some(prev) = *last {
                if prev.elapsed() < FORCE_RECONNECT_WINDOW {
                    tracing::warn!("force reconnect throttled, dropping request");
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }

        self.disconnect(Some("force reconnect")).await;
        self.lock_inner().state.reconnect_attempts = 0;
        sleep(FORCE_RECONNECT_DELAY).await;

        self.connect(ConnectionParams::default()).await?;
        self.events
            .emit(ClientEvent::Reconnect, &json!({ "forced": true }));
        Ok(())
    }

    /// Disconnect, restore the initial state, and clear persisted params.
    pub async fn reset(&self) {
        self.disconnect(Some("reset")).await;
        {
            let mut inner = self.lock_inner();
            inner.state = ConnectionState::default();
            inner.last_params = None;
            self.set_status(&mut inner, ConnectionStatus::Disconnected);
        }
        self.storage.remove(PARAMS_STORAGE_KEY);
    }

    /// Merge a partial config update and persist the result.
    pub fn update_config(&self, update: ConfigUpdate) -> PhoenixConfig {
        let mut inner = self.lock_inner();
        if inner.config.apply(update) {
            storage::save(&*self.storage, CONFIG_STORAGE_KEY, &inner.config);
        }
        inner.config.clone()
    }

    /// Read-only config snapshot.
    pub fn get_config(&self) -> PhoenixConfig {
        self.lock_inner().config.clone()
    }

    /// Restore config defaults and drop the persisted record.
    pub fn clear_config(&self) {
        self.lock_inner().config = PhoenixConfig::default();
        self.storage.remove(CONFIG_STORAGE_KEY);
    }

    /// Defensive copy of the connection state.
    pub fn get_state(&self) -> ConnectionState {
        self.lock_inner().state.clone()
    }

    /// Current status only.
    pub fn status(&self) -> ConnectionStatus {
        self.lock_inner().state.status
    }

    /// Watch channel for status transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Connected by both our state machine and the transport's own report.
    pub fn is_connected(&self) -> bool {
        let inner = self.lock_inner();
        inner.state.status == ConnectionStatus::Connected
            && inner
                .transport
                .as_ref()
                .map(|t| t.is_connected())
                .unwrap_or(false)
    }

    /// A fresh connect attempt is allowed only from these states.
    pub fn can_connect(&self) -> bool {
        matches!(
            self.status(),
            ConnectionStatus::Disconnected | ConnectionStatus::Error
        )
    }

    // ------------------------------------------------------------------
    // Transport callbacks
    // ------------------------------------------------------------------

    fn install_socket_hooks(self: &Arc<Self>, transport: &Arc<dyn SocketTransport>) {
        let notify = self.open_notify.clone();
        let mgr: Weak<Self> = Arc::downgrade(self);
        transport.on_open(Box::new(move || {
            notify.notify_one();
            if let Some(mgr) = mgr.upgrade() {
                mgr.on_transport_open();
            }
        }));

        let mgr: Weak<Self> = Arc::downgrade(self);
        transport.on_close(Box::new(move || {
            if let Some(mgr) = mgr.upgrade() {
                mgr.on_transport_close();
            }
        }));

        let mgr: Weak<Self> = Arc::downgrade(self);
        transport.on_error(Box::new(move |text| {
            if let Some(mgr) = mgr.upgrade() {
                mgr.on_transport_error(text);
            }
        }));
    }

    /// The transport recovered on its own after a drop.
    fn on_transport_open(self: &Arc<Self>) {
        let reconnected = {
            let mut inner = self.lock_inner();
            if inner.state.status == ConnectionStatus::Reconnecting {
                inner.state.last_connected = Some(Utc::now());
                inner.state.reconnect_attempts = 0;
                inner.state.error = None;
                self.set_status(&mut inner, ConnectionStatus::Connected);
                true
            } else {
                false
            }
        };
        if reconnected {
            tracing::info!("transport re-established connection");
            self.events
                .emit(ClientEvent::Reconnect, &json!({ "forced": false }));
        }
    }

    /// The transport dropped; its own retry loop takes over.
    fn on_transport_close(self: &Arc<Self>) {
        let mut inner = self.lock_inner();
        if inner.closing {
            return;
        }
        if inner.state.status == ConnectionStatus::Connected {
            inner.state.last_disconnected = Some(Utc::now());
            self.set_status(&mut inner, ConnectionStatus::Reconnecting);
            tracing::warn!("transport dropped, awaiting its reconnect");
        }
    }

    /// Transport error text: poll-status faults go to recovery, everything
    /// else is recorded and reported as a generic error event.
    fn on_transport_error(self: &Arc<Self>, text: &str) {
        if fault::is_poll_status_fault(text) {
            tracing::warn!(error = %text, "poll status fault from transport");
            let mgr = self.clone();
            tokio::spawn(mgr.recover_from_poll_fault());
            return;
        }
        self.lock_inner().state.error = Some(text.to_string());
        tracing::error!(error = %text, "transport error");
        self.events.emit(
            ClientEvent::Error,
            &json!({ "scope": "transport", "reason": text }),
        );
    }

    // ------------------------------------------------------------------
    // Poll-status recovery
    // ------------------------------------------------------------------

    /// Dedicated recovery for the long-poll fault: disable long-poll, tear
    /// down the transport, reconnect after a fixed delay with the stored
    /// params. Leaves the normal failure counters untouched.
    pub async fn recover_from_poll_fault(self: Arc<Self>) {
        let (transport, params) = {
            let mut inner = self.lock_inner();
            if inner.state.status == ConnectionStatus::Reconnecting {
                // A recovery cycle is already running.
                return;
            }
            inner.config.use_long_poll = false;
            storage::save(&*self.storage, CONFIG_STORAGE_KEY, &inner.config);
            self.set_status(&mut inner, ConnectionStatus::Reconnecting);
            (
                inner.transport.take(),
                inner.last_params.clone().unwrap_or_default(),
            )
        };
        tracing::warn!("recovering from poll status fault: long-poll disabled");

        self.notify_swap(None);
        if let Some(t) = transport {
            let _ = t.close().await;
        }

        sleep(RECOVERY_DELAY).await;

        {
            let mut inner = self.lock_inner();
            self.set_status(&mut inner, ConnectionStatus::Connecting);
        }
        match self.attempt_connect(params, false).await {
            Ok(_) => {
                tracing::info!("poll status recovery reconnect succeeded");
                self.events
                    .emit(ClientEvent::Reconnect, &json!({ "recovered": true }));
            }
            Err(e) => {
                let recovery = Error::RecoveryFailed(e.to_string());
                tracing::error!(error = %recovery, "poll status recovery failed");
                self.events.emit(
                    ClientEvent::Error,
                    &json!({ "scope": "recovery", "reason": recovery.to_string() }),
                );
            }
        }
    }

    /// Install the process-wide fault guard once and drain its signal into
    /// this manager's recovery path.
    fn ensure_fault_guard(self: &Arc<Self>) {
        if let Some(mut rx) = fault::install_guard() {
            let mgr: Weak<Self> = Arc::downgrade(self);
            tokio::spawn(async move {
                while let Some(text) = rx.recv().await {
                    tracing::warn!(error = %text, "poll status fault via process guard");
                    match mgr.upgrade() {
                        Some(mgr) => {
                            tokio::spawn(mgr.recover_from_poll_fault());
                        }
                        None => break,
                    }
                }
            });
        }
    }

    // ------------------------------------------------------------------

    fn set_status(&self, inner: &mut Inner, status: ConnectionStatus) {
        inner.state.status = status;
        self.status_tx.send_replace(status);
    }

    fn notify_swap(&self, transport: Option<Arc<dyn SocketTransport>>) {
        if let Some(observer) = &*lock_plain(&self.swap_observer) {
            observer(transport);
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        lock_plain(&self.inner)
    }
}

fn lock_plain<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Resilient Backplane Channel
///
/// Masks coordination-backplane outages from the rest of the control plane:
/// - Connection state machine with exponential-backoff reconnection
/// - Circuit breaker independent of connection state
/// - Bounded local cache serving reads while the backplane is unreachable
/// - Subscriptions that re-establish themselves after every reconnect
/// - Call metrics with a rolling latency window

// Backplane trait and in-process implementation
pub mod backplane;

// Closed/Open/HalfOpen breaker
pub mod breaker;

// LRU + TTL read-fallback cache
pub mod cache;

// Counters and latency window
pub mod metrics;

pub use backplane::{Backplane, BackplaneError, MemoryBackplane, Subscription};
pub use breaker::{BreakerSettings, CircuitBreaker, CircuitState};
pub use cache::LocalCache;
pub use metrics::{ChannelMetrics, MetricsSnapshot};

use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Tuning for reconnection, health checks, cache and breaker
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    pub health_check_interval: Duration,
    pub operation_timeout: Duration,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_reconnect_attempts: None,
            health_check_interval: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(3),
            cache_capacity: 10_000,
            cache_ttl: Duration::from_secs(600),
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
        }
    }
}

impl ChannelConfig {
    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            open_timeout: self.open_timeout,
        }
    }

    /// Delay before reconnect attempt number `attempt` (zero-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    /// Partial success: the value is in the local cache but not on the backplane
    #[error("stored locally only: {0}")]
    LocalOnly(String),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("backplane not connected (state: {0:?})")]
    NotConnected(ConnectionState),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Backplane(#[from] BackplaneError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChannelError {
    /// True when the write still landed in the local cache
    pub fn is_partial_success(&self) -> bool {
        matches!(self, ChannelError::LocalOnly(_))
    }
}

pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Connection, breaker and cache overview for the ops surface
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub connection: ConnectionState,
    pub circuit: CircuitState,
    pub healthy: bool,
    pub cached_entries: usize,
    pub subscriptions: usize,
    pub metrics: MetricsSnapshot,
}

pub struct ResilientChannel {
    backplane: Arc<dyn Backplane>,
    config: ChannelConfig,
    state: watch::Sender<ConnectionState>,
    // bumped on every transition into Connected
    epoch: watch::Sender<u64>,
    breaker: Mutex<CircuitBreaker>,
    cache: Mutex<LocalCache>,
    subscriptions: Mutex<HashMap<String, CancellationToken>>,
    callbacks: RwLock<Vec<StateCallback>>,
    reconnecting: AtomicBool,
    metrics: ChannelMetrics,
    shutdown: CancellationToken,
    me: Weak<ResilientChannel>,
}

impl ResilientChannel {
    /// Open the channel and start its health checks
    ///
    /// Never fails: when the first ping does not succeed the channel starts in
    /// `Reconnecting` and serves writes and reads from its local cache meanwhile.
    pub async fn connect(backplane: Arc<dyn Backplane>, config: ChannelConfig) -> Arc<Self> {
        let channel = Arc::new_cyclic(|me| Self {
            backplane,
            breaker: Mutex::new(CircuitBreaker::new(config.breaker_settings())),
            cache: Mutex::new(LocalCache::new(config.cache_capacity, config.cache_ttl)),
            config,
            state: watch::channel(ConnectionState::Disconnected).0,
            epoch: watch::channel(0).0,
            subscriptions: Mutex::new(HashMap::new()),
            callbacks: RwLock::new(Vec::new()),
            reconnecting: AtomicBool::new(false),
            metrics: ChannelMetrics::default(),
            shutdown: CancellationToken::new(),
            me: me.clone(),
        });

        match channel.ping().await {
            Ok(()) => {
                tracing::info!("🔗 Backplane channel connected");
                channel.set_state(ConnectionState::Connected);
            }
            Err(e) => {
                tracing::warn!("⚠️ Backplane unreachable at startup: {}", e);
                channel.start_reconnect();
            }
        }

        channel.spawn_health_loop();
        channel
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver observing every connection state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().state()
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Connected && self.circuit_state() != CircuitState::Open
    }

    /// Register a callback invoked on every connection state transition
    pub fn on_state_change<F>(&self, callback: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            connection: self.state(),
            circuit: self.circuit_state(),
            healthy: self.is_healthy(),
            cached_entries: self.cache.lock().len(),
            subscriptions: self.subscriptions.lock().len(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Write `value` locally, then through to the backplane when permitted
    ///
    /// A failed remote write returns `ChannelError::LocalOnly`; the value is
    /// still readable from this process.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), ChannelError> {
        self.cache.lock().put(key, value.to_string(), ttl);

        match self.guarded(self.backplane.set(key, value, ttl)).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!(key, "Remote write skipped, kept in local cache: {}", e);
                Err(ChannelError::LocalOnly(e.to_string()))
            }
        }
    }

    /// Read remote first, falling back to the local cache
    pub async fn get(&self, key: &str) -> Result<String, ChannelError> {
        match self.guarded(self.backplane.get(key)).await {
            Ok(Some(value)) => {
                self.cache.lock().put(key, value.clone(), None);
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(key, "Remote read unavailable, using local cache: {}", e),
        }

        let cached = self.cache.lock().get(key);
        match cached {
            Some(value) => {
                self.metrics.record_cache_hit();
                Ok(value)
            }
            None => {
                self.metrics.record_cache_miss();
                Err(ChannelError::NotFound(key.to_string()))
            }
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), ChannelError> {
        let payload = serde_json::to_string(value)?;
        self.set(key, &payload, ttl).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, ChannelError> {
        let payload = self.get(key).await?;
        Ok(serde_json::from_str(&payload)?)
    }

    /// Publish a message; fails fast when disconnected or the circuit is open
    pub async fn publish(&self, channel: &str, message: &str) -> Result<u64, ChannelError> {
        let receivers = self.guarded(self.backplane.publish(channel, message)).await?;
        self.metrics.record_published();
        Ok(receivers)
    }

    /// Register a self-healing subscription, replacing any previous one for `channel`
    pub fn subscribe<F>(&self, channel: &str, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let Some(this) = self.me.upgrade() else {
            return;
        };

        let token = self.shutdown.child_token();
        if let Some(previous) = self
            .subscriptions
            .lock()
            .insert(channel.to_string(), token.clone())
        {
            previous.cancel();
        }

        let channel = channel.to_string();
        let handler: MessageHandler = Arc::new(handler);
        tokio::spawn(async move {
            this.run_subscription(channel, handler, token).await;
        });
    }

    /// Drop a subscription; returns false if none was registered
    pub fn unsubscribe(&self, channel: &str) -> bool {
        match self.subscriptions.lock().remove(channel) {
            Some(token) => {
                token.cancel();
                tracing::debug!(channel, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Stop health checks, reconnection and every subscription
    pub fn close(&self) {
        tracing::info!("⏹️ Closing backplane channel");
        self.shutdown.cancel();
        self.subscriptions.lock().clear();
        self.set_state(ConnectionState::Disconnected);
    }

    async fn ping(&self) -> Result<(), BackplaneError> {
        match tokio::time::timeout(self.config.operation_timeout, self.backplane.ping()).await {
            Ok(result) => result,
            Err(_) => Err(BackplaneError::Timeout),
        }
    }

    /// Run one backplane call behind the connection check, breaker and timeout
    async fn guarded<T>(
        &self,
        call: impl Future<Output = Result<T, BackplaneError>>,
    ) -> Result<T, ChannelError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(ChannelError::NotConnected(state));
        }
        if !self.breaker.lock().allow() {
            return Err(ChannelError::CircuitOpen);
        }

        self.metrics.record_request();
        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.operation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BackplaneError::Timeout),
        };

        match result {
            Ok(value) => {
                self.breaker.lock().on_success();
                self.metrics.record_success(started.elapsed());
                Ok(value)
            }
            Err(e) => {
                self.metrics.record_failure();
                let tripped = self.breaker.lock().on_failure();
                if tripped {
                    self.metrics.record_circuit_trip();
                }
                if e.is_connection_loss() {
                    self.connection_lost(&e);
                }
                Err(e.into())
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous == next {
            return;
        }

        tracing::info!("🔄 Backplane connection {:?} -> {:?}", previous, next);
        if next == ConnectionState::Connected {
            self.epoch.send_modify(|epoch| *epoch += 1);
        }

        let callbacks: Vec<StateCallback> = self.callbacks.read().clone();
        for callback in callbacks {
            callback(next);
        }
    }

    fn connection_lost(&self, error: &BackplaneError) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self.state() == ConnectionState::Connected {
            tracing::warn!("⚠️ Backplane connection lost: {}", error);
            self.set_state(ConnectionState::Disconnected);
        }
        self.start_reconnect();
    }

    fn start_reconnect(&self) {
        if self.shutdown.is_cancelled() || self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.me.upgrade() else {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        };

        tokio::spawn(async move {
            this.reconnect_loop().await;
            this.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_loop(&self) {
        self.set_state(ConnectionState::Reconnecting);
        let mut attempt: u32 = 0;

        loop {
            if let Some(max) = self.config.max_reconnect_attempts {
                if attempt >= max {
                    tracing::error!("❌ Giving up on backplane after {} reconnect attempts", attempt);
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }
            }

            let delay = self.config.backoff_delay(attempt);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            self.metrics.record_reconnect_attempt();
            match self.ping().await {
                Ok(()) => {
                    tracing::info!("✅ Backplane reconnected after {} attempt(s)", attempt);
                    self.set_state(ConnectionState::Connected);
                    return;
                }
                Err(e) => {
                    tracing::debug!(
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "Reconnect attempt failed: {}",
                        e
                    );
                }
            }
        }
    }

    fn spawn_health_loop(&self) {
        let weak = self.me.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.config.health_check_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(channel) = weak.upgrade() else {
                    break;
                };
                channel.health_check().await;
            }
            tracing::debug!("Health check loop stopped");
        });
    }

    async fn health_check(&self) {
        match self.state() {
            ConnectionState::Connected => {
                if let Err(e) = self.ping().await {
                    self.connection_lost(&e);
                }
            }
            ConnectionState::Disconnected => self.start_reconnect(),
            ConnectionState::Reconnecting => {}
        }
    }

    async fn run_subscription(self: Arc<Self>, channel: String, handler: MessageHandler, token: CancellationToken) {
        let mut state_rx = self.state.subscribe();
        let mut epoch_rx = self.epoch.subscribe();
        let mut failures: u32 = 0;

        loop {
            let connected = tokio::select! {
                _ = token.cancelled() => return,
                ready = async { state_rx.wait_for(|s| *s == ConnectionState::Connected).await.is_ok() } => ready,
            };
            if !connected {
                return;
            }
            epoch_rx.mark_unchanged();

            let subscribed = match tokio::time::timeout(
                self.config.operation_timeout,
                self.backplane.subscribe(&channel),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(BackplaneError::Timeout),
            };

            match subscribed {
                Ok(mut messages) => {
                    failures = 0;
                    tracing::info!("📡 Subscribed to channel: {}", channel);
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            message = messages.recv() => match message {
                                Some(message) => {
                                    self.metrics.record_received();
                                    handler(message);
                                }
                                None => {
                                    tracing::warn!("⚠️ Subscription to {} closed, resubscribing", channel);
                                    break;
                                }
                            },
                            changed = epoch_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                                tracing::debug!(channel = %channel, "Backplane reconnected, resubscribing");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("⚠️ Subscribe to {} failed: {}", channel, e);
                    if e.is_connection_loss() {
                        self.connection_lost(&e);
                    }
                }
            }

            let delay = self.config.backoff_delay(failures);
            failures = failures.saturating_add(1);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

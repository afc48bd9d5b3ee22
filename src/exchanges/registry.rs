//! Construction, bounded parallel initialization and restart of all configured adapters.

use crate::config::{AdapterConfig, GatewayConfig};
use crate::core::GatewayEvent;
use crate::exchanges::adapter::{ExchangeAdapter, EVENT_CHANNEL_CAPACITY};
use crate::exchanges::binance::{self, BinanceAdapter, BinanceClient};
use crate::exchanges::bybit::{self, BybitAdapter, BybitClient};
use crate::exchanges::connection_manager::ConnectionState;
use crate::exchanges::error::{GatewayError, GatewayResult};
use crate::exchanges::okx::{self, OkxAdapter, OkxClient};
use crate::exchanges::transport::{StreamTransport, TungsteniteTransport};
use crate::market_data::MarketDataCache;
use crate::monitoring::HealthStatus;
use futures_util::future::join_all;
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

/// Builds adapters from their configuration
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        config: &AdapterConfig,
        cache: Arc<MarketDataCache>,
    ) -> GatewayResult<Arc<dyn ExchangeAdapter>>;
}

/// Factory for the built-in Binance, OKX and Bybit adapters
pub struct DefaultAdapterFactory {
    transport: Arc<dyn StreamTransport>,
}

impl DefaultAdapterFactory {
    pub fn new() -> Self {
        Self::with_transport(Arc::new(TungsteniteTransport))
    }

    /// Same adapters over a custom WebSocket transport
    pub fn with_transport(transport: Arc<dyn StreamTransport>) -> Self {
        Self { transport }
    }
}

impl Default for DefaultAdapterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn create(
        &self,
        config: &AdapterConfig,
        cache: Arc<MarketDataCache>,
    ) -> GatewayResult<Arc<dyn ExchangeAdapter>> {
        let transport = Arc::clone(&self.transport);
        let adapter: Arc<dyn ExchangeAdapter> = match config.exchange_name.as_str() {
            binance::EXCHANGE => Arc::new(BinanceAdapter::new(
                config.clone(),
                BinanceClient::new(config),
                cache,
                transport,
            )),
            okx::EXCHANGE => Arc::new(OkxAdapter::new(
                config.clone(),
                OkxClient::new(config),
                cache,
                transport,
            )),
            bybit::EXCHANGE => Arc::new(BybitAdapter::new(
                config.clone(),
                BybitClient::new(config),
                cache,
                transport,
            )),
            other => {
                return Err(GatewayError::configuration(
                    other,
                    "unsupported exchange",
                ))
            }
        };
        Ok(adapter)
    }
}

/// Outcome of [`ExchangeRegistry::initialize_all`], exchange names in registration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializationReport {
    pub connected: Vec<String>,
    pub disabled: Vec<String>,
    pub missing_credentials: Vec<String>,
    pub failed: Vec<String>,
}

struct Slot {
    adapter: Arc<dyn ExchangeAdapter>,
    /// Re-publishes the adapter's events on the registry bus and refreshes its status.
    /// Hands the event receiver back once stopped.
    forwarder: JoinHandle<broadcast::Receiver<GatewayEvent>>,
    stop: oneshot::Sender<()>,
    bus: broadcast::Sender<GatewayEvent>,
}

impl Slot {
    /// Stop status updates first, then disconnect the adapter and publish whatever it
    /// emitted. The status map keeps the last recorded health until the caller writes a
    /// new one.
    async fn teardown(self) {
        let _ = self.stop.send(());
        let receiver = self.forwarder.await.ok();
        self.adapter.disconnect().await;
        let Some(mut receiver) = receiver else {
            return;
        };
        loop {
            match receiver.try_recv() {
                Ok(event) => {
                    let _ = self.bus.send(event);
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }
}

/// Owns every adapter instance. Created once and passed to consumers by reference.
pub struct ExchangeRegistry {
    /// Registration order
    order: Vec<String>,
    configs: HashMap<String, AdapterConfig>,
    preferred: Option<String>,
    factory: Arc<dyn AdapterFactory>,
    cache: Arc<MarketDataCache>,
    slots: RwLock<HashMap<String, Slot>>,
    status: Arc<RwLock<HashMap<String, HealthStatus>>>,
    events: broadcast::Sender<GatewayEvent>,
    /// Serializes restarts and full initialization
    lifecycle: Mutex<()>,
}

impl ExchangeRegistry {
    pub fn new(
        configs: Vec<AdapterConfig>,
        preferred: Option<String>,
        cache: Arc<MarketDataCache>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        let mut order = Vec::new();
        let mut by_name = HashMap::new();
        for config in configs {
            let name = config.exchange_name.clone();
            if by_name.contains_key(&name) {
                warn!("Duplicate configuration for {} ignored", name);
                continue;
            }
            order.push(name.clone());
            by_name.insert(name, config);
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            order,
            configs: by_name,
            preferred: preferred.map(|p| p.trim().to_lowercase()),
            factory,
            cache,
            slots: RwLock::new(HashMap::new()),
            status: Arc::new(RwLock::new(HashMap::new())),
            events,
            lifecycle: Mutex::new(()),
        }
    }

    /// Registry over the built-in adapters
    pub fn from_config(config: &GatewayConfig, cache: Arc<MarketDataCache>) -> Self {
        Self::new(
            config.exchanges.clone(),
            config.preferred_exchange.clone(),
            cache,
            Arc::new(DefaultAdapterFactory::new()),
        )
    }

    pub fn cache(&self) -> &Arc<MarketDataCache> {
        &self.cache
    }

    /// Configured exchange names in registration order
    pub fn exchange_names(&self) -> &[String] {
        &self.order
    }

    /// Validate locally, then initialize every passing adapter concurrently
    pub async fn initialize_all(&self) -> InitializationReport {
        let _guard = self.lifecycle.lock().await;
        let previous = self.take_slots();
        if !previous.is_empty() {
            info!("Re-initializing, tearing down {} running adapters", previous.len());
            join_all(previous.into_iter().map(|(_, slot)| slot.teardown())).await;
        }

        let mut report = InitializationReport::default();
        let mut pending = Vec::new();

        for name in &self.order {
            let Some(config) = self.configs.get(name) else {
                continue;
            };
            match self.prepare(config) {
                Ok(adapter) => pending.push(self.start(config, adapter)),
                Err(Rejection::Disabled) => report.disabled.push(name.clone()),
                Err(Rejection::Credentials) => report.missing_credentials.push(name.clone()),
                Err(Rejection::Unsupported) => report.failed.push(name.clone()),
            }
        }

        for (name, connected) in join_all(pending).await {
            if connected {
                report.connected.push(name);
            } else {
                report.failed.push(name);
            }
        }

        info!(
            "Exchange initialization: {} connected, {} disabled, {} missing credentials, {} failed",
            report.connected.len(),
            report.disabled.len(),
            report.missing_credentials.len(),
            report.failed.len()
        );
        report
    }

    /// Preferred exchange when connected, else the first connected in registration order
    pub fn get_primary_exchange(&self) -> Option<String> {
        let slots = self.slots.read().ok()?;
        let connected = |name: &String| {
            slots
                .get(name)
                .map_or(false, |slot| slot.adapter.is_connected())
        };
        if let Some(preferred) = &self.preferred {
            if connected(preferred) {
                return Some(preferred.clone());
            }
        }
        self.order.iter().find(|name| connected(name)).cloned()
    }

    pub fn get_adapter(&self, name: &str) -> Option<Arc<dyn ExchangeAdapter>> {
        let name = name.trim().to_lowercase();
        self.slots
            .read()
            .ok()?
            .get(&name)
            .map(|slot| Arc::clone(&slot.adapter))
    }

    /// Adapters currently reporting connected, in registration order
    pub fn connected_adapters(&self) -> Vec<Arc<dyn ExchangeAdapter>> {
        let Ok(slots) = self.slots.read() else {
            return Vec::new();
        };
        self.order
            .iter()
            .filter_map(|name| slots.get(name))
            .filter(|slot| slot.adapter.is_connected())
            .map(|slot| Arc::clone(&slot.adapter))
            .collect()
    }

    /// Tear the adapter down and run the startup initialization sequence again.
    /// Returns whether the new instance connected.
    pub async fn restart_exchange(&self, name: &str) -> GatewayResult<bool> {
        let name = name.trim().to_lowercase();
        let config = self
            .configs
            .get(&name)
            .ok_or_else(|| GatewayError::configuration(&name, "exchange is not configured"))?;

        let _guard = self.lifecycle.lock().await;
        info!("Restarting {}", name);

        let old = self.slots.write().ok().and_then(|mut slots| slots.remove(&name));
        if let Some(slot) = old {
            slot.teardown().await;
        }

        match self.prepare(config) {
            Ok(adapter) => {
                let (_, connected) = self.start(config, adapter).await;
                Ok(connected)
            }
            Err(Rejection::Disabled) => Err(GatewayError::configuration(&name, "exchange is disabled")),
            Err(Rejection::Credentials) => Err(GatewayError::configuration(
                &name,
                "missing or malformed credentials",
            )),
            Err(Rejection::Unsupported) => {
                Err(GatewayError::configuration(&name, "unsupported exchange"))
            }
        }
    }

    /// Point-in-time copy of every exchange's health. Never touches the network.
    pub fn get_connection_status(&self) -> HashMap<String, HealthStatus> {
        self.status
            .read()
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    /// Events of every adapter, including instances created by later restarts
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Disconnect every adapter and stop all forwarders
    pub async fn disconnect_all(&self) {
        let _guard = self.lifecycle.lock().await;
        for (name, slot) in self.take_slots() {
            slot.teardown().await;
            set_status(
                &self.status,
                HealthStatus::offline(&name, "disconnect requested"),
            );
        }
        info!("All exchanges disconnected");
    }

    fn take_slots(&self) -> Vec<(String, Slot)> {
        self.slots
            .write()
            .map(|mut slots| slots.drain().collect())
            .unwrap_or_default()
    }

    /// Build the adapter and run local validation; no network traffic
    fn prepare(&self, config: &AdapterConfig) -> Result<Arc<dyn ExchangeAdapter>, Rejection> {
        let name = &config.exchange_name;
        if !config.enabled {
            info!("{} is disabled, skipping", name);
            set_status(&self.status, HealthStatus::offline(name, "disabled"));
            return Err(Rejection::Disabled);
        }
        let adapter = self
            .factory
            .create(config, Arc::clone(&self.cache))
            .map_err(|e| {
                error!("{}", e);
                set_status(&self.status, HealthStatus::offline(name, e.to_string()));
                Rejection::Unsupported
            })?;
        if let Err(e) = config
            .credentials()
            .validate(adapter.features().requires_passphrase)
        {
            warn!("{} skipped: {}", name, e);
            set_status(&self.status, HealthStatus::offline(name, e.to_string()));
            return Err(Rejection::Credentials);
        }
        Ok(adapter)
    }

    /// Bounded initialization, then install the adapter and record its status
    async fn start(
        &self,
        config: &AdapterConfig,
        adapter: Arc<dyn ExchangeAdapter>,
    ) -> (String, bool) {
        let name = config.exchange_name.clone();
        // subscribe first so the Connected event raised during initialize reaches the bus
        let receiver = adapter.subscribe();
        let outcome = initialize_bounded(adapter.as_ref(), config).await;

        let connected = match &outcome {
            Ok(connected) => *connected,
            Err(e) => {
                error!("{} initialization failed: {}", name, e);
                false
            }
        };
        if !connected {
            warn!("{} did not connect", name);
        }

        // changes after this snapshot are picked up by the forwarder
        let states = adapter.watch_state();
        let mut health = adapter.health().await;
        if let (false, Err(e)) = (connected, &outcome) {
            health.reason.get_or_insert_with(|| e.to_string());
        }
        set_status(&self.status, health);

        let (stop, stopped) = oneshot::channel();
        let forwarder = spawn_forwarder(
            Arc::clone(&adapter),
            receiver,
            states,
            stopped,
            self.events.clone(),
            Arc::clone(&self.status),
        );
        if let Ok(mut slots) = self.slots.write() {
            slots.insert(
                name.clone(),
                Slot {
                    adapter,
                    forwarder,
                    stop,
                    bus: self.events.clone(),
                },
            );
        }
        (name, connected)
    }
}

enum Rejection {
    Disabled,
    Credentials,
    Unsupported,
}

/// Up to `retry_attempts` tries, each bounded by `connection_timeout`, spaced by `retry_delay`.
/// Terminal errors end the sequence immediately.
async fn initialize_bounded(
    adapter: &dyn ExchangeAdapter,
    config: &AdapterConfig,
) -> GatewayResult<bool> {
    let name = adapter.name();
    let attempts = config.retry_attempts.max(1);
    let mut last = Ok(false);

    for attempt in 1..=attempts {
        match timeout(config.connection_timeout(), adapter.initialize()).await {
            Ok(Ok(true)) => return Ok(true),
            Ok(Err(e)) if e.is_terminal() => return Err(e),
            Ok(Err(e)) => {
                warn!("{} attempt {}/{} failed: {}", name, attempt, attempts, e);
                last = Err(e);
            }
            Ok(Ok(false)) => {
                warn!("{} attempt {}/{} did not connect", name, attempt, attempts);
                last = Ok(false);
            }
            Err(_) => {
                warn!("{} attempt {}/{} timed out", name, attempt, attempts);
                last = Err(GatewayError::network(name, "initialization timed out"));
            }
        }
        if attempt < attempts {
            sleep(config.retry_delay()).await;
        }
    }
    last
}

fn set_status(status: &RwLock<HashMap<String, HealthStatus>>, health: HealthStatus) {
    if let Ok(mut map) = status.write() {
        map.insert(health.exchange_name.clone(), health);
    }
}

enum Wake {
    Event(Result<GatewayEvent, broadcast::error::RecvError>),
    StateChanged(bool),
}

/// Next stream state change; pends forever for adapters without a stream.
/// `false` once the stream is gone.
async fn state_changed(states: &mut Option<watch::Receiver<ConnectionState>>) -> bool {
    match states {
        Some(states) => states.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

fn spawn_forwarder(
    adapter: Arc<dyn ExchangeAdapter>,
    mut receiver: broadcast::Receiver<GatewayEvent>,
    mut states: Option<watch::Receiver<ConnectionState>>,
    mut stop: oneshot::Receiver<()>,
    bus: broadcast::Sender<GatewayEvent>,
    status: Arc<RwLock<HashMap<String, HealthStatus>>>,
) -> JoinHandle<broadcast::Receiver<GatewayEvent>> {
    tokio::spawn(async move {
        loop {
            // pending events win over the stop signal
            let wake = tokio::select! {
                biased;
                received = receiver.recv() => Wake::Event(received),
                _ = &mut stop => break,
                changed = state_changed(&mut states) => Wake::StateChanged(changed),
            };
            let event = match wake {
                Wake::StateChanged(true) => {
                    set_status(&status, adapter.health().await);
                    continue;
                }
                Wake::StateChanged(false) => {
                    states = None;
                    continue;
                }
                Wake::Event(Ok(event)) => event,
                Wake::Event(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!("{} event forwarder skipped {} events", adapter.name(), skipped);
                    continue;
                }
                Wake::Event(Err(broadcast::error::RecvError::Closed)) => break,
            };
            match &event {
                GatewayEvent::Ticker(_) => {}
                GatewayEvent::Error(e) => {
                    error!("{}", e);
                    set_status(&status, adapter.health().await);
                }
                _ => set_status(&status, adapter.health().await),
            }
            let _ = bus.send(event);
        }
        receiver
    })
}

//! In-memory doubles for the adapter and transport seams.

use crate::config::AdapterConfig;
use crate::core::{
    Balance, GatewayEvent, OrderRequest, OrderResult, OrderStatus, Ticker,
};
use crate::exchanges::adapter::{ExchangeAdapter, ExchangeFeatures, EVENT_CHANNEL_CAPACITY};
use crate::exchanges::connection_manager::{ConnectionState, StreamHandler};
use crate::exchanges::error::{GatewayError, GatewayResult};
use crate::exchanges::registry::AdapterFactory;
use crate::exchanges::transport::{StreamConnection, StreamTransport, WsFrame};
use crate::market_data::MarketDataCache;
use crate::monitoring::HealthStatus;
use crate::types::{Price, Size, Symbol};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Mock exchange adapter for testing
pub struct MockExchangeAdapter {
    name: String,
    cache: Arc<MarketDataCache>,
    events: broadcast::Sender<GatewayEvent>,
    connected: AtomicBool,
    rest_failing: AtomicBool,
    /// Outcomes returned by successive `initialize` calls; `Ok(true)` once drained
    init_results: Mutex<VecDeque<GatewayResult<bool>>>,
    init_delay: Option<Duration>,
    /// Price served by the REST path
    ticker: Option<(Price, Decimal)>,
    balance: GatewayResult<Balance>,
    order_error: Option<GatewayError>,
    initialize_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    order_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
}

impl MockExchangeAdapter {
    /// Create a new mock exchange adapter
    pub fn new(name: &str, cache: Arc<MarketDataCache>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name: name.to_string(),
            cache,
            events,
            connected: AtomicBool::new(false),
            rest_failing: AtomicBool::new(false),
            init_results: Mutex::new(VecDeque::new()),
            init_delay: None,
            ticker: None,
            balance: Ok(Balance::new()),
            order_error: None,
            initialize_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            order_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
        }
    }

    /// Queue the outcomes of the next `initialize` calls
    pub fn with_init_results(self, results: Vec<GatewayResult<bool>>) -> Self {
        if let Ok(mut queue) = self.init_results.lock() {
            queue.extend(results);
        }
        self
    }

    /// Make every `initialize` call take this long
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = Some(delay);
        self
    }

    /// Serve this price and 24h change from the REST path
    pub fn with_ticker(mut self, price: Price, change_percent: Decimal) -> Self {
        self.ticker = Some((price, change_percent));
        self
    }

    pub fn with_balance(mut self, balance: GatewayResult<Balance>) -> Self {
        self.balance = balance;
        self
    }

    pub fn with_order_error(mut self, error: GatewayError) -> Self {
        self.order_error = Some(error);
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_rest_failing(&self, failing: bool) {
        self.rest_failing.store(failing, Ordering::SeqCst);
    }

    /// Push a stream-style ticker into the shared cache
    pub fn push_ticker(&self, symbol: Symbol, price: Price) -> Arc<Ticker> {
        let ticker = mock_ticker(&self.name, symbol, price, Decimal::ZERO);
        let _ = self.events.send(GatewayEvent::Ticker(ticker.clone()));
        self.cache.store(ticker)
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn order_calls(&self) -> usize {
        self.order_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchangeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn features(&self) -> ExchangeFeatures {
        ExchangeFeatures {
            rest: true,
            streaming: false,
            trading: true,
            requires_passphrase: false,
        }
    }

    async fn initialize(&self) -> GatewayResult<bool> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.init_delay {
            tokio::time::sleep(delay).await;
        }
        let outcome = self
            .init_results
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or(Ok(true));
        if let Ok(connected) = &outcome {
            self.set_connected(*connected);
            if *connected {
                let _ = self.events.send(GatewayEvent::Connected {
                    exchange: self.name.clone(),
                });
            }
        }
        outcome
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Option<Arc<Ticker>> {
        if let Some(ticker) = self.cache.fresh(&self.name, symbol) {
            return Some(ticker);
        }
        match self.fetch_ticker(symbol).await {
            Ok(ticker) => Some(ticker),
            Err(_) => self.cache.get(&self.name, symbol).map(|entry| entry.ticker),
        }
    }

    async fn fetch_ticker(&self, symbol: &Symbol) -> GatewayResult<Arc<Ticker>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.rest_failing.load(Ordering::SeqCst) {
            return Err(GatewayError::network(&self.name, "mock REST failure"));
        }
        let (price, change) = self
            .ticker
            .ok_or_else(|| GatewayError::invalid_response(&self.name, "unknown symbol"))?;
        Ok(self
            .cache
            .store(mock_ticker(&self.name, symbol.clone(), price, change)))
    }

    async fn get_balance(&self) -> GatewayResult<Balance> {
        self.balance.clone()
    }

    async fn create_order(&self, request: &OrderRequest) -> GatewayResult<OrderResult> {
        if !self.is_connected() {
            return Err(GatewayError::not_connected(&self.name, "mock adapter disconnected"));
        }
        let count = self.order_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = &self.order_error {
            return Err(error.clone());
        }
        Ok(OrderResult {
            exchange: self.name.clone(),
            order_id: format!("{}-{}", self.name, count),
            symbol: request.symbol.clone(),
            side: request.side,
            amount: request.amount,
            price: request.price,
            status: OrderStatus::New,
            timestamp: Utc::now(),
        })
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.cache.clear_exchange(&self.name);
        if was_connected {
            let _ = self.events.send(GatewayEvent::Disconnected {
                exchange: self.name.clone(),
                reason: Some("disconnect requested".to_string()),
            });
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn health(&self) -> HealthStatus {
        let connected = self.is_connected();
        let state = if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        HealthStatus::new(&self.name, state, connected, Some(1), None)
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }
}

fn mock_ticker(exchange: &str, symbol: Symbol, price: Price, change: Decimal) -> Ticker {
    Ticker {
        symbol,
        price,
        bid: price,
        ask: price,
        volume: Size::new(Decimal::ONE_HUNDRED),
        change_percent: change,
        timestamp: Utc::now(),
        source_exchange: exchange.to_string(),
        raw: None,
    }
}

type Setup = Box<dyn Fn(MockExchangeAdapter) -> MockExchangeAdapter + Send + Sync>;

/// Factory producing [`MockExchangeAdapter`]s and remembering every instance it built
pub struct MockAdapterFactory {
    setup: Setup,
    created: Mutex<Vec<Arc<MockExchangeAdapter>>>,
}

impl MockAdapterFactory {
    pub fn new(
        setup: impl Fn(MockExchangeAdapter) -> MockExchangeAdapter + Send + Sync + 'static,
    ) -> Self {
        Self {
            setup: Box::new(setup),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Every instance built for `exchange`, oldest first
    pub fn created(&self, exchange: &str) -> Vec<Arc<MockExchangeAdapter>> {
        self.created
            .lock()
            .map(|all| {
                all.iter()
                    .filter(|a| a.name == exchange)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Most recent instance built for `exchange`
    pub fn latest(&self, exchange: &str) -> Option<Arc<MockExchangeAdapter>> {
        self.created(exchange).pop()
    }
}

impl AdapterFactory for MockAdapterFactory {
    fn create(
        &self,
        config: &AdapterConfig,
        cache: Arc<MarketDataCache>,
    ) -> GatewayResult<Arc<dyn ExchangeAdapter>> {
        let adapter = Arc::new((self.setup)(MockExchangeAdapter::new(
            &config.exchange_name,
            cache,
        )));
        if let Ok(mut created) = self.created.lock() {
            created.push(Arc::clone(&adapter));
        }
        Ok(adapter)
    }
}

/// In-memory WebSocket transport
#[derive(Default)]
pub struct MockTransport {
    opens: AtomicUsize,
    active: Arc<AtomicUsize>,
    /// Remaining opens that fail; `usize::MAX` fails forever
    failures: AtomicUsize,
    /// Pongs are not sent back while set
    mute: Arc<AtomicBool>,
    peers: Mutex<Vec<mpsc::UnboundedSender<WsFrame>>>,
    sent: Arc<Mutex<Vec<WsFrame>>>,
    /// Handshake latency applied before each open is counted
    open_delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` opens with a transient network error
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Make every following handshake take `delay`
    pub fn delay_opens(&self, delay: Duration) {
        if let Ok(mut slot) = self.open_delay.lock() {
            *slot = Some(delay);
        }
    }

    pub fn fail_always(&self) {
        self.failures.store(usize::MAX, Ordering::SeqCst);
    }

    /// Stop (or resume) answering pings
    pub fn mute_pongs(&self, mute: bool) {
        self.mute.store(mute, Ordering::SeqCst);
    }

    /// Opens that reached the server, failed ones included
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Connections not yet dropped
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Deliver a frame to the newest connection
    pub fn push(&self, frame: WsFrame) -> bool {
        self.peers
            .lock()
            .ok()
            .and_then(|peers| peers.last().map(|peer| peer.send(frame).is_ok()))
            .unwrap_or(false)
    }

    /// Simulate the server closing the newest connection
    pub fn close_latest(&self) -> bool {
        self.push(WsFrame::Close)
    }

    /// Every frame written by any connection
    pub fn sent_frames(&self) -> Vec<WsFrame> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl StreamTransport for MockTransport {
    async fn open(&self, exchange: &str, _url: &str) -> GatewayResult<Box<dyn StreamConnection>> {
        let delay = self.open_delay.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(GatewayError::network(exchange, "connection refused"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut peers) = self.peers.lock() {
            peers.push(tx.clone());
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            inbound: rx,
            loopback: tx,
            active: Arc::clone(&self.active),
            mute: Arc::clone(&self.mute),
            sent: Arc::clone(&self.sent),
        }))
    }
}

struct MockConnection {
    inbound: mpsc::UnboundedReceiver<WsFrame>,
    loopback: mpsc::UnboundedSender<WsFrame>,
    active: Arc<AtomicUsize>,
    mute: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<WsFrame>>>,
}

impl MockConnection {
    fn reply_to(frame: &WsFrame) -> Option<WsFrame> {
        match frame {
            WsFrame::Ping(payload) => Some(WsFrame::Pong(payload.clone())),
            WsFrame::Text(text) if text == "ping" => Some(WsFrame::Text("pong".to_string())),
            WsFrame::Text(text) => {
                let json: Value = serde_json::from_str(text).ok()?;
                (json.get("op").and_then(Value::as_str) == Some("ping"))
                    .then(|| WsFrame::Text(r#"{"op":"pong"}"#.to_string()))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl StreamConnection for MockConnection {
    async fn send(&mut self, frame: WsFrame) -> GatewayResult<()> {
        if !self.mute.load(Ordering::SeqCst) {
            if let Some(reply) = Self::reply_to(&frame) {
                let _ = self.loopback.send(reply);
            }
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(frame);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<GatewayResult<WsFrame>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.inbound.close();
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Stream protocol for tests: WebSocket ping frames and `{"symbol","price"}` JSON ticks
pub struct MockStreamHandler {
    exchange: String,
}

impl MockStreamHandler {
    pub fn new(exchange: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
        }
    }
}

impl StreamHandler for MockStreamHandler {
    fn stream_url(&self) -> String {
        format!("mock://{}/stream", self.exchange)
    }

    fn subscribe_frames(&self) -> Vec<WsFrame> {
        vec![WsFrame::Text(r#"{"op":"subscribe"}"#.to_string())]
    }

    fn ping_frame(&self) -> WsFrame {
        WsFrame::Ping(Vec::new())
    }

    fn is_pong(&self, frame: &WsFrame) -> bool {
        matches!(frame, WsFrame::Pong(_))
    }

    fn parse_ticker(&self, text: &str) -> Option<Ticker> {
        let json: Value = serde_json::from_str(text).ok()?;
        let symbol = Symbol::parse(json.get("symbol")?.as_str()?).ok()?;
        let price = Price::from_str(json.get("price")?.as_str()?).ok()?;
        Some(mock_ticker(&self.exchange, symbol, price, Decimal::ZERO))
    }
}

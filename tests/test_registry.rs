//! Registry and gateway over the built-in adapters
//!
//! REST traffic goes to a wiremock server, streams run on the in-memory transport.

use exchange_gateway::core::GatewayEvent;
use exchange_gateway::exchanges::{
    ConnectionState, DefaultAdapterFactory, ExchangeRegistry, MockTransport, WsFrame,
};
use exchange_gateway::market_data::MarketDataCache;
use exchange_gateway::types::{Price, Symbol};
use exchange_gateway::{AdapterConfig, TradingGateway};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "abcdefghijklmnop1234";
const SECRET: &str = "qrstuvwxyz0123456789";

fn binance_config(server: &MockServer) -> AdapterConfig {
    let mut config = AdapterConfig::new("binance").with_credentials(KEY, SECRET);
    config.rest_url = Some(server.uri());
    config.ws_url = Some("mock://binance".to_string());
    config.symbols = vec![Symbol::new("BTC", "USDT")];
    config.silent_mode = true;
    config
}

async fn binance_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    server
}

fn registry(configs: Vec<AdapterConfig>, transport: &Arc<MockTransport>) -> ExchangeRegistry {
    ExchangeRegistry::new(
        configs,
        Some("binance".to_string()),
        Arc::new(MarketDataCache::new(Duration::from_secs(10))),
        Arc::new(DefaultAdapterFactory::with_transport(Arc::clone(transport) as _)),
    )
}

async fn drain(events: &mut broadcast::Receiver<GatewayEvent>) -> Vec<GatewayEvent> {
    // forwarders hop through one extra channel
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// =============================================================================
// Initialization
// =============================================================================

#[tokio::test]
async fn test_initialize_reports_every_outcome() {
    let server = binance_server().await;
    let transport = Arc::new(MockTransport::new());

    let mut disabled = AdapterConfig::new("bybit").with_credentials(KEY, SECRET);
    disabled.enabled = false;
    let no_passphrase = AdapterConfig::new("okx").with_credentials(KEY, SECRET);
    let unsupported = AdapterConfig::new("kraken").with_credentials(KEY, SECRET);

    let registry = registry(
        vec![binance_config(&server), disabled, no_passphrase, unsupported],
        &transport,
    );
    let report = registry.initialize_all().await;

    assert_eq!(report.connected, vec!["binance"]);
    assert_eq!(report.disabled, vec!["bybit"]);
    assert_eq!(report.missing_credentials, vec!["okx"]);
    assert_eq!(report.failed, vec!["kraken"]);

    // only binance ever opened a socket
    assert_eq!(transport.open_count(), 1);
    assert_eq!(registry.get_primary_exchange().as_deref(), Some("binance"));

    let status = registry.get_connection_status();
    assert!(status["binance"].connected);
    assert!(!status["bybit"].connected);
    assert_eq!(status["bybit"].reason.as_deref(), Some("disabled"));
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn test_repeated_restart_leaves_one_socket() {
    let server = binance_server().await;
    let transport = Arc::new(MockTransport::new());
    let registry = registry(vec![binance_config(&server)], &transport);
    let mut events = registry.subscribe();

    registry.initialize_all().await;
    assert_eq!(transport.active_count(), 1);

    assert!(registry.restart_exchange("binance").await.unwrap());
    assert!(registry.restart_exchange("Binance").await.unwrap());

    assert_eq!(transport.open_count(), 3);
    assert_eq!(transport.active_count(), 1);

    let seen = drain(&mut events).await;
    let connected = seen
        .iter()
        .filter(|e| matches!(e, GatewayEvent::Connected { .. }))
        .count();
    let disconnected = seen
        .iter()
        .filter(|e| matches!(e, GatewayEvent::Disconnected { .. }))
        .count();
    assert_eq!(connected, 3);
    assert_eq!(disconnected, 2);
    assert!(registry.get_connection_status()["binance"].connected);
}

#[tokio::test]
async fn test_restart_after_endpoint_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ping"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let transport = Arc::new(MockTransport::new());
    let mut config = binance_config(&server);
    config.retry_attempts = 1;
    let registry = registry(vec![config], &transport);

    let report = registry.initialize_all().await;
    assert_eq!(report.failed, vec!["binance"]);
    assert!(registry.get_primary_exchange().is_none());
    assert!(registry.get_adapter("binance").is_some());

    // the failed instance stays installed so it can be restarted
    assert!(!registry.restart_exchange("binance").await.unwrap());
    assert!(!registry.restart_exchange("binance").await.unwrap());
    assert!(registry.restart_exchange("binance").await.unwrap());
    assert_eq!(registry.get_primary_exchange().as_deref(), Some("binance"));
    assert_eq!(transport.active_count(), 1);
}

#[tokio::test]
async fn test_reinitialize_leaves_no_orphan_socket() {
    let server = binance_server().await;
    let transport = Arc::new(MockTransport::new());
    let registry = registry(vec![binance_config(&server)], &transport);

    registry.initialize_all().await;
    registry.initialize_all().await;
    assert_eq!(transport.open_count(), 2);
    assert_eq!(transport.active_count(), 1);

    registry.disconnect_all().await;
    assert_eq!(transport.active_count(), 0);
}

// =============================================================================
// Status tracking
// =============================================================================

#[tokio::test]
async fn test_status_follows_transitions_without_events() {
    let server = binance_server().await;
    let transport = Arc::new(MockTransport::new());
    let mut config = binance_config(&server);
    config.health_check_interval = 200;
    let registry = registry(vec![config], &transport);
    registry.initialize_all().await;
    assert_eq!(
        registry.get_connection_status()["binance"].state,
        ConnectionState::Connected
    );

    // ping at 200ms unanswered at 400ms
    transport.mute_pongs(true);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = registry.get_connection_status();
    assert_eq!(status["binance"].state, ConnectionState::Degraded);
    assert!(status["binance"].connected);

    // the 600ms ping is answered
    transport.mute_pongs(false);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = registry.get_connection_status();
    assert_eq!(status["binance"].state, ConnectionState::Connected);
    assert!(status["binance"].latency_estimate.is_some());
    assert_eq!(transport.open_count(), 1);
}

// =============================================================================
// Gateway over streamed data
// =============================================================================

#[tokio::test]
async fn test_streamed_ticker_served_without_rest() {
    let server = binance_server().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/24hr"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let transport = Arc::new(MockTransport::new());
    let gateway = TradingGateway::new(
        Arc::new(registry(vec![binance_config(&server)], &transport)),
        None,
    );
    let mut events = gateway.subscribe();
    gateway.initialize().await;

    let frame = json!({
        "stream": "btcusdt@ticker",
        "data": {
            "e": "24hrTicker",
            "E": 1_700_000_000_000_i64,
            "s": "BTCUSDT",
            "c": "67500.00",
            "b": "67499.50",
            "a": "67500.50",
            "v": "1234.5",
            "P": "-1.25"
        }
    });
    assert!(transport.push(WsFrame::Text(frame.to_string())));

    let seen = drain(&mut events).await;
    assert!(seen
        .iter()
        .any(|e| matches!(e, GatewayEvent::Ticker(t) if t.source_exchange == "binance")));

    let ticker = gateway
        .get_ticker(&Symbol::new("BTC", "USDT"))
        .await
        .unwrap();
    assert_eq!(ticker.price, Price::from_str("67500.00").unwrap());
    assert_eq!(ticker.source_exchange, "binance");
    assert!(ticker.raw.is_none());
}

#[tokio::test]
async fn test_shutdown_closes_every_socket() {
    let server = binance_server().await;
    let transport = Arc::new(MockTransport::new());
    let gateway = TradingGateway::new(
        Arc::new(registry(vec![binance_config(&server)], &transport)),
        None,
    );
    gateway.initialize().await;
    assert_eq!(transport.active_count(), 1);

    gateway.shutdown().await;

    assert_eq!(transport.active_count(), 0);
    assert!(gateway.registry().connected_adapters().is_empty());
    let status = gateway.get_exchange_status();
    assert!(!status["binance"].connected);

    // nothing reconnects behind our back
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.open_count(), 1);
}

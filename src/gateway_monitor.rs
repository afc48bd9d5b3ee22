use exchange_gateway::monitoring::{summarize, OverallHealth};
use exchange_gateway::{
    init_logging, ExchangeStatus, GatewayConfig, GatewayEvent, Symbol, Ticker, TradingGateway,
};
use log::{error, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::time::{interval, Duration};

const REPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Print exchange status table
fn print_status(status: &BTreeMap<String, ExchangeStatus>, primary: Option<&str>) {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║ 🔌 EXCHANGE STATUS                                         ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    for (name, entry) in status {
        let marker = if Some(name.as_str()) == primary { "*" } else { " " };
        let latency = entry
            .latency
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "║ {}{:10} {:16} {:>8}  {:20} ║",
            marker,
            name,
            format!("{:?}", entry.state),
            latency,
            entry.reason.as_deref().unwrap_or("").chars().take(20).collect::<String>()
        );
    }
    println!("╚════════════════════════════════════════════════════════════╝");
}

/// Print one ticker line
fn print_ticker(symbol: &Symbol, ticker: Option<&Ticker>) {
    match ticker {
        Some(t) => println!(
            "  📈 {:10} {:>14} bid {:>14} ask {:>14} {:>8}% [{}]",
            symbol.to_string(),
            t.price.to_string(),
            t.bid.to_string(),
            t.ask.to_string(),
            t.change_percent.round_dp(2).to_string(),
            t.source_exchange
        ),
        None => println!("  📉 {:10} no data", symbol.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Config file path as first argument, environment otherwise
    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::from_file(&path)?,
        None => GatewayConfig::from_env(),
    };

    init_logging(&config.log_level, config.log_file.as_deref())?;
    info!(
        "Starting gateway monitor for {} configured exchanges",
        config.exchanges.len()
    );

    let watched: BTreeSet<Symbol> = config
        .exchanges
        .iter()
        .filter(|e| e.enabled)
        .flat_map(|e| e.symbols.iter().cloned())
        .collect();

    let gateway = Arc::new(TradingGateway::from_config(&config));

    // Log connectivity events as they arrive
    let mut events = gateway.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(GatewayEvent::Connected { exchange }) => info!("✅ {} connected", exchange),
                Ok(GatewayEvent::Disconnected { exchange, reason }) => warn!(
                    "{} disconnected: {}",
                    exchange,
                    reason.as_deref().unwrap_or("connection closed")
                ),
                Ok(GatewayEvent::CircuitOpen { exchange, retry_in }) => warn!(
                    "{} circuit open, next attempt in {}s",
                    exchange,
                    retry_in.as_secs()
                ),
                Ok(GatewayEvent::Error(e)) => error!("{}", e),
                Ok(GatewayEvent::Ticker(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event monitor lagged by {} events", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let report = gateway.initialize().await;
    info!("🚀 Initialization finished: {}", serde_json::to_string(&report)?);

    let mut ticks = interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                let primary = gateway.registry().get_primary_exchange();
                print_status(&gateway.get_exchange_status(), primary.as_deref());
                match summarize(&gateway.registry().get_connection_status()) {
                    OverallHealth::Healthy => info!("Overall health: all exchanges connected"),
                    OverallHealth::Degraded => warn!("Overall health: degraded"),
                    OverallHealth::Unhealthy => error!("Overall health: no exchange connected"),
                }
                for symbol in &watched {
                    let ticker = gateway.get_ticker(symbol).await;
                    print_ticker(symbol, ticker.as_ref());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    gateway.shutdown().await;
    Ok(())
}

use crate::exchanges::error::GatewayError;
use crate::types::{Price, Size, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Source tag used for tickers obtained from the public fallback aggregator
pub const PUBLIC_SOURCE: &str = "public";

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Order status as reported back by the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

/// Canonical 24h ticker. Never mutated; a newer ticker for the same
/// (exchange, symbol) replaces it in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: Symbol,
    pub price: Price,
    pub bid: Price,
    pub ask: Price,
    pub volume: Size,
    pub change_percent: Decimal,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "exchange")]
    pub source_exchange: String,
    /// Raw exchange payload kept for diagnostics only
    #[serde(skip)]
    pub raw: Option<serde_json::Value>,
}

impl Ticker {
    /// Copy without the diagnostic payload, for handing out through the façade
    pub fn without_raw(&self) -> Self {
        Self {
            raw: None,
            ..self.clone()
        }
    }
}

/// Free/locked split for one currency. `total` is always `free + locked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Size,
    pub locked: Size,
    pub total: Size,
}

impl AssetBalance {
    pub fn new(free: Size, locked: Size) -> Self {
        Self {
            free,
            locked,
            total: free + locked,
        }
    }
}

/// Balances per currency; entries whose total is zero are never stored
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Balance {
    assets: BTreeMap<String, AssetBalance>,
}

impl Balance {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry; zero-total entries are dropped and repeated currencies are summed
    pub fn insert(&mut self, currency: impl Into<String>, free: Size, locked: Size) {
        let entry = AssetBalance::new(free, locked);
        if !entry.total.is_positive() {
            return;
        }
        let currency = currency.into().to_uppercase();
        let merged = match self.assets.get(&currency) {
            Some(existing) => AssetBalance::new(existing.free + free, existing.locked + locked),
            None => entry,
        };
        self.assets.insert(currency, merged);
    }

    /// Fold another balance into this one, currency by currency
    pub fn merge(&mut self, other: &Balance) {
        for (currency, asset) in &other.assets {
            self.insert(currency.clone(), asset.free, asset.locked);
        }
    }

    pub fn get(&self, currency: &str) -> Option<&AssetBalance> {
        self.assets.get(&currency.to_uppercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AssetBalance)> {
        self.assets.iter()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }
}

/// Order request in canonical form. `amount` is always base-asset quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub amount: Size,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub price: Option<Price>,
}

impl OrderRequest {
    pub fn market(symbol: Symbol, side: OrderSide, amount: Size) -> Self {
        Self {
            symbol,
            side,
            amount,
            order_type: OrderType::Market,
            price: None,
        }
    }

    pub fn limit(symbol: Symbol, side: OrderSide, amount: Size, price: Price) -> Self {
        Self {
            symbol,
            side,
            amount,
            order_type: OrderType::Limit,
            price: Some(price),
        }
    }
}

/// Confirmed order acknowledgement. Only built from a successful exchange response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResult {
    pub exchange: String,
    pub order_id: String,
    pub symbol: Symbol,
    pub side: OrderSide,
    pub amount: Size,
    pub price: Option<Price>,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
}

/// Closed set of notifications published by adapters and their resilience managers
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Connected {
        exchange: String,
    },
    Disconnected {
        exchange: String,
        reason: Option<String>,
    },
    Ticker(Ticker),
    Error(GatewayError),
    CircuitOpen {
        exchange: String,
        retry_in: Duration,
    },
}

impl GatewayEvent {
    /// Name of the exchange the event originates from
    pub fn exchange(&self) -> &str {
        match self {
            GatewayEvent::Connected { exchange }
            | GatewayEvent::Disconnected { exchange, .. }
            | GatewayEvent::CircuitOpen { exchange, .. } => exchange,
            GatewayEvent::Ticker(ticker) => &ticker.source_exchange,
            GatewayEvent::Error(error) => &error.exchange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(s: &str) -> Size {
        Size::from_str(s).unwrap()
    }

    #[test]
    fn test_balance_drops_empty_entries() {
        let mut balance = Balance::new();
        balance.insert("usdt", size("100"), size("25"));
        balance.insert("BTC", size("0"), size("0"));

        assert_eq!(balance.len(), 1);
        let usdt = balance.get("USDT").unwrap();
        assert_eq!(usdt.total, size("125"));
        assert!(balance.get("BTC").is_none());
    }

    #[test]
    fn test_balance_merge_keeps_total_invariant() {
        let mut first = Balance::new();
        first.insert("BTC", size("0.5"), size("0.1"));
        let mut second = Balance::new();
        second.insert("BTC", size("0.25"), size("0"));
        second.insert("ETH", size("2"), size("0"));

        first.merge(&second);
        let btc = first.get("BTC").unwrap();
        assert_eq!(btc.free, size("0.75"));
        assert_eq!(btc.locked, size("0.1"));
        assert_eq!(btc.total, btc.free + btc.locked);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_order_request_json_shape() {
        let json = r#"{"symbol":"BTC/USDT","side":"buy","amount":"0.01","type":"limit","price":"65000"}"#;
        let request: OrderRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.symbol, Symbol::new("BTC", "USDT"));
        assert_eq!(request.order_type, OrderType::Limit);
        assert_eq!(request.price, Some(Price::from_str("65000").unwrap()));
    }

    #[test]
    fn test_ticker_serializes_exchange_and_hides_raw() {
        let ticker = Ticker {
            symbol: Symbol::new("BTC", "USDT"),
            price: Price::from_str("67500").unwrap(),
            bid: Price::from_str("67499").unwrap(),
            ask: Price::from_str("67501").unwrap(),
            volume: size("1200"),
            change_percent: Decimal::new(-475, 2),
            timestamp: Utc::now(),
            source_exchange: "binance".to_string(),
            raw: Some(serde_json::json!({"lastPrice": "67500"})),
        };
        let value = serde_json::to_value(&ticker).unwrap();
        assert_eq!(value["exchange"], "binance");
        assert_eq!(value["changePercent"], -4.75);
        assert!(value.get("raw").is_none());
    }
}

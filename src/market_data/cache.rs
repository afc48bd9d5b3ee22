use crate::core::{Ticker, PUBLIC_SOURCE};
use crate::types::Symbol;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One cache slot. The ticker is shared, so repeated reads hand out the same allocation.
#[derive(Debug, Clone)]
pub struct CachedTicker {
    pub ticker: Arc<Ticker>,
    pub received_at: Instant,
}

impl CachedTicker {
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.received_at)
    }

    /// Fresh means strictly younger than the window
    pub fn is_fresh(&self, window: Duration) -> bool {
        self.age() < window
    }
}

/// Latest ticker per (exchange, symbol).
///
/// Writes are last-writer-wins per key and replace the whole slot, so readers never
/// see a half-written entry. Readers choosing across exchanges go by receive time.
#[derive(Debug)]
pub struct MarketDataCache {
    entries: DashMap<(String, Symbol), CachedTicker>,
    freshness_window: Duration,
}

impl MarketDataCache {
    pub fn new(freshness_window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            freshness_window,
        }
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    /// Store a ticker under its source exchange and return the shared handle
    pub fn store(&self, ticker: Ticker) -> Arc<Ticker> {
        let ticker = Arc::new(ticker);
        let key = (ticker.source_exchange.clone(), ticker.symbol.clone());
        self.entries.insert(
            key,
            CachedTicker {
                ticker: Arc::clone(&ticker),
                received_at: Instant::now(),
            },
        );
        ticker
    }

    pub fn get(&self, exchange: &str, symbol: &Symbol) -> Option<CachedTicker> {
        self.entries
            .get(&(exchange.to_string(), symbol.clone()))
            .map(|entry| entry.value().clone())
    }

    /// Entry for the exchange only if it is still inside the freshness window
    pub fn fresh(&self, exchange: &str, symbol: &Symbol) -> Option<Arc<Ticker>> {
        self.get(exchange, symbol)
            .filter(|entry| entry.is_fresh(self.freshness_window))
            .map(|entry| entry.ticker)
    }

    /// Most recently received fresh entry among the given exchanges
    pub fn freshest_among(&self, symbol: &Symbol, exchanges: &[String]) -> Option<Arc<Ticker>> {
        exchanges
            .iter()
            .filter_map(|exchange| self.get(exchange, symbol))
            .filter(|entry| entry.is_fresh(self.freshness_window))
            .max_by_key(|entry| entry.received_at)
            .map(|entry| entry.ticker)
    }

    /// Most recently received entry from any exchange adapter, regardless of age.
    /// Public-aggregator entries are excluded.
    pub fn latest_from_exchanges(&self, symbol: &Symbol) -> Option<CachedTicker> {
        self.entries
            .iter()
            .filter(|entry| entry.key().1 == *symbol && entry.key().0 != PUBLIC_SOURCE)
            .map(|entry| entry.value().clone())
            .max_by_key(|entry| entry.received_at)
    }

    /// Whether any exchange adapter has ever cached this symbol
    pub fn seen_by_exchange(&self, symbol: &Symbol) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.key().1 == *symbol && entry.key().0 != PUBLIC_SOURCE)
    }

    /// Drop every entry written by one exchange
    pub fn clear_exchange(&self, exchange: &str) {
        self.entries.retain(|(source, _), _| source != exchange);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Gateway configuration.
//!
//! Everything is plain serde data in camelCase so the same structures can be read
//! from a JSON file or assembled from environment variables. Durations are integer
//! milliseconds on the wire and exposed as [`Duration`] through accessors.

use crate::security::{Credentials, SecureApiKey};
use crate::types::Symbol;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Per-exchange settings. Read once when the adapter is built and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdapterConfig {
    #[serde(alias = "exchange", alias = "name")]
    pub exchange_name: String,
    pub enabled: bool,
    pub api_key: Option<SecureApiKey>,
    pub api_secret: Option<SecureApiKey>,
    pub passphrase: Option<SecureApiKey>,
    pub sandbox: bool,
    /// Suppresses informational logging only
    pub silent_mode: bool,
    /// Open a WebSocket ticker stream in addition to REST
    pub streaming: bool,
    /// Pairs subscribed over the stream
    pub symbols: Vec<Symbol>,
    pub rest_url: Option<String>,
    pub ws_url: Option<String>,
    pub connection_timeout: u64,
    pub retry_attempts: u32,
    pub retry_delay: u64,
    pub rate_limit_per_minute: u32,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: u64,
    pub health_check_interval: u64,
    pub max_missed_pings: u32,
    pub initial_delay: u64,
    pub multiplier: f64,
    pub max_delay: u64,
    pub jitter_factor: f64,
    pub rate_limit_min_delay: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            exchange_name: String::new(),
            enabled: true,
            api_key: None,
            api_secret: None,
            passphrase: None,
            sandbox: false,
            silent_mode: false,
            streaming: true,
            symbols: vec![Symbol::new("BTC", "USDT"), Symbol::new("ETH", "USDT")],
            rest_url: None,
            ws_url: None,
            connection_timeout: 10_000,
            retry_attempts: 3,
            retry_delay: 2_000,
            rate_limit_per_minute: 1_200,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: 60_000,
            health_check_interval: 30_000,
            max_missed_pings: 3,
            initial_delay: 1_000,
            multiplier: 1.5,
            max_delay: 30_000,
            jitter_factor: 0.2,
            rate_limit_min_delay: 5_000,
        }
    }
}

impl AdapterConfig {
    pub fn new(exchange_name: impl Into<String>) -> Self {
        Self {
            exchange_name: exchange_name.into().to_lowercase(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, api_key: &str, api_secret: &str) -> Self {
        self.api_key = Some(SecureApiKey::new(api_key));
        self.api_secret = Some(SecureApiKey::new(api_secret));
        self
    }

    pub fn with_passphrase(mut self, passphrase: &str) -> Self {
        self.passphrase = Some(SecureApiKey::new(passphrase));
        self
    }

    /// Build from `<EXCHANGE>_API_KEY`, `<EXCHANGE>_API_SECRET`,
    /// `<EXCHANGE>_PASSPHRASE`, `<EXCHANGE>_SANDBOX` and `<EXCHANGE>_ENABLED`.
    /// Missing credentials are left empty so validation reports them later.
    pub fn from_env(exchange_name: &str) -> Self {
        let prefix = exchange_name.to_uppercase();
        let mut config = Self::new(exchange_name);
        config.api_key = SecureApiKey::from_env(&format!("{}_API_KEY", prefix)).ok();
        config.api_secret = SecureApiKey::from_env(&format!("{}_API_SECRET", prefix)).ok();
        config.passphrase = SecureApiKey::from_env(&format!("{}_PASSPHRASE", prefix)).ok();
        config.sandbox = env_flag(&format!("{}_SANDBOX", prefix)).unwrap_or(false);
        config.enabled = env_flag(&format!("{}_ENABLED", prefix)).unwrap_or(true);
        config
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            passphrase: self.passphrase.clone(),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }

    /// Streaming-connection policy derived from this config
    pub fn resilience(&self) -> ResilienceConfig {
        ResilienceConfig {
            initial_delay: Duration::from_millis(self.initial_delay),
            multiplier: self.multiplier,
            max_delay: Duration::from_millis(self.max_delay),
            jitter_factor: self.jitter_factor.clamp(0.0, 1.0),
            circuit_breaker_threshold: self.circuit_breaker_threshold.max(1),
            circuit_breaker_timeout: Duration::from_millis(self.circuit_breaker_timeout),
            health_check_interval: Duration::from_millis(self.health_check_interval.max(1)),
            max_missed_pings: self.max_missed_pings.max(1),
            connection_timeout: self.connection_timeout(),
            rate_limit_min_delay: Duration::from_millis(self.rate_limit_min_delay),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Reconnect, circuit-breaker and health-check policy for one streaming connection
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_factor: f64,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    pub health_check_interval: Duration,
    pub max_missed_pings: u32,
    pub connection_timeout: Duration,
    pub rate_limit_min_delay: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        AdapterConfig::default().resilience()
    }
}

/// Ticker cache policy
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Maximum age in milliseconds at which a cached ticker is served without refetching
    pub freshness_window: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            freshness_window: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window)
    }
}

/// Top-level configuration for the whole gateway
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    pub preferred_exchange: Option<String>,
    pub log_level: String,
    pub log_file: Option<String>,
    pub fallback_enabled: bool,
    pub fallback_url: Option<String>,
    pub cache: CacheConfig,
    pub exchanges: Vec<AdapterConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            preferred_exchange: None,
            log_level: "info".to_string(),
            log_file: None,
            fallback_enabled: true,
            fallback_url: None,
            cache: CacheConfig::default(),
            exchanges: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let mut config: GatewayConfig = serde_json::from_str(json)?;
        for exchange in &mut config.exchanges {
            exchange.exchange_name = exchange.exchange_name.trim().to_lowercase();
        }
        config.check()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Assemble from `GATEWAY_EXCHANGES` (comma separated, default "binance,okx,bybit"),
    /// `GATEWAY_PRIMARY_EXCHANGE` and the per-exchange variables read by
    /// [`AdapterConfig::from_env`].
    pub fn from_env() -> Self {
        let names = env::var("GATEWAY_EXCHANGES").unwrap_or_else(|_| "binance,okx,bybit".into());
        let exchanges = names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(AdapterConfig::from_env)
            .collect();
        Self {
            preferred_exchange: env::var("GATEWAY_PRIMARY_EXCHANGE").ok(),
            log_level: env::var("GATEWAY_LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            exchanges,
            ..Self::default()
        }
    }

    fn check(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for exchange in &self.exchanges {
            if exchange.exchange_name.trim().is_empty() {
                return Err(ConfigError::Invalid("exchange entry without a name".into()));
            }
            if !seen.insert(exchange.exchange_name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "exchange '{}' configured twice",
                    exchange.exchange_name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_config_defaults() {
        let config = AdapterConfig::new("Binance");
        assert_eq!(config.exchange_name, "binance");
        assert!(config.enabled);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));

        let resilience = config.resilience();
        assert_eq!(resilience.initial_delay, Duration::from_millis(1000));
        assert_eq!(resilience.multiplier, 1.5);
        assert_eq!(resilience.max_delay, Duration::from_millis(30_000));
        assert_eq!(resilience.max_missed_pings, 3);
    }

    #[test]
    fn test_gateway_config_from_json() {
        let json = r#"{
            "preferredExchange": "okx",
            "cache": { "freshnessWindow": 30000 },
            "exchanges": [
                { "exchangeName": "binance", "apiKey": "k", "apiSecret": "s", "sandbox": true,
                  "symbols": ["BTC/USDT", "SOLUSDT"], "circuitBreakerThreshold": 2 },
                { "exchange": "okx", "enabled": false, "silentMode": true }
            ]
        }"#;
        let config = GatewayConfig::from_json_str(json).unwrap();
        assert_eq!(config.preferred_exchange.as_deref(), Some("okx"));
        assert_eq!(config.cache.freshness_window(), Duration::from_secs(30));
        assert_eq!(config.exchanges.len(), 2);

        let binance = &config.exchanges[0];
        assert!(binance.sandbox);
        assert_eq!(binance.api_key.as_ref().unwrap().expose(), "k");
        assert_eq!(binance.symbols[1], Symbol::new("SOL", "USDT"));
        assert_eq!(binance.resilience().circuit_breaker_threshold, 2);

        let okx = &config.exchanges[1];
        assert!(!okx.enabled);
        assert!(okx.silent_mode);
        assert_eq!(okx.retry_attempts, 3);
    }

    #[test]
    fn test_gateway_config_rejects_duplicates() {
        let json = r#"{ "exchanges": [ { "exchangeName": "bybit" }, { "exchangeName": "BYBIT" } ] }"#;
        assert!(matches!(
            GatewayConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));
    }
}

use crate::exchanges::connection_manager::ConnectionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Point-in-time health of one exchange. Always rebuilt from adapter state,
/// never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub exchange_name: String,
    pub connected: bool,
    pub state: ConnectionState,
    /// Last measured round trip in milliseconds
    pub latency_estimate: Option<u64>,
    pub last_update: DateTime<Utc>,
    pub reason: Option<String>,
}

impl HealthStatus {
    pub fn new(
        exchange_name: impl Into<String>,
        state: ConnectionState,
        connected: bool,
        latency_estimate: Option<u64>,
        reason: Option<String>,
    ) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            connected,
            state,
            latency_estimate,
            last_update: Utc::now(),
            reason,
        }
    }

    /// Status for an exchange that never got past local validation
    pub fn offline(exchange_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            exchange_name,
            ConnectionState::Disconnected,
            false,
            None,
            Some(reason.into()),
        )
    }
}

/// Roll-up over all exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Healthy when every exchange is connected, unhealthy when none is
pub fn summarize(statuses: &HashMap<String, HealthStatus>) -> OverallHealth {
    let connected = statuses.values().filter(|s| s.connected).count();
    let degraded = statuses
        .values()
        .any(|s| s.state == ConnectionState::Degraded);
    match connected {
        0 => OverallHealth::Unhealthy,
        n if n == statuses.len() && !degraded => OverallHealth::Healthy,
        _ => OverallHealth::Degraded,
    }
}

//! Broker and outbox configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Message broker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Retry budget for subscriptions created without an explicit one. Default: 3.
    pub default_max_retries: u32,
    /// Delay before the first delivery retry. Default: 100ms.
    pub retry_base_delay_ms: u64,
    /// Cap on the delivery retry delay. Default: 30s.
    pub retry_max_delay_ms: u64,
    /// Timeout used by `receive_from_queue_default`. Default: 5s.
    pub receive_timeout_ms: u64,
    /// Maximum messages retained in the broker history. Default: 1000.
    pub history_limit: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 30_000,
            receive_timeout_ms: 5_000,
            history_limit: 1_000,
        }
    }
}

impl BrokerConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// Where the outbox publishes entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteType {
    /// Publish to a topic named after the entry's aggregate type.
    #[default]
    AggregateType,
    /// Publish every entry to one fixed topic.
    Topic,
    /// Send every entry to one fixed queue.
    Queue,
}

/// Outbox publish route (discriminated union).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Route type discriminator.
    #[serde(rename = "type")]
    pub route_type: RouteType,
    /// Topic or queue name. Ignored for `aggregate_type`.
    pub name: String,
}

/// Transactional outbox configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Failed publish attempts before an entry is marked failed. Default: 5.
    pub max_retries: u32,
    /// Interval between polling passes. Default: 1s.
    pub poll_interval_ms: u64,
    /// Start the polling loop with the runtime. Default: true.
    pub polling_enabled: bool,
    /// Where entries are published.
    pub route: RouteConfig,
    /// Age after which published entries are purged. Default: 24h.
    pub purge_after_hours: f64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            poll_interval_ms: 1_000,
            polling_enabled: true,
            route: RouteConfig::default(),
            purge_after_hours: 24.0,
        }
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

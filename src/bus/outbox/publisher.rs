//! Outbox publishers: into the broker, or into the log.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use super::{OutboxEnvelope, OutboxPublisher};
use crate::bus::{Headers, MessageBroker, Payload};
use crate::config::{RouteConfig, RouteType};
use crate::observer::BoxError;

/// Source recorded on broker messages published from the outbox.
pub const OUTBOX_SOURCE: &str = "outbox";

/// Where [`BrokerPublisher`] sends each envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishRoute {
    /// Publish to the topic named by the entry's aggregate type.
    AggregateType,
    Topic(String),
    Queue(String),
}

impl From<&RouteConfig> for PublishRoute {
    fn from(config: &RouteConfig) -> Self {
        match config.route_type {
            RouteType::AggregateType => Self::AggregateType,
            RouteType::Topic => Self::Topic(config.name.clone()),
            RouteType::Queue => Self::Queue(config.name.clone()),
        }
    }
}

/// Forwards outbox envelopes into the [`MessageBroker`].
///
/// The broker message payload is the serialized envelope; headers carry
/// `event_type`, `aggregate_type` and `aggregate_id` for routing without
/// parsing the body.
#[derive(Debug, Clone)]
pub struct BrokerPublisher {
    broker: MessageBroker,
    route: PublishRoute,
}

impl BrokerPublisher {
    pub fn new(broker: MessageBroker, route: PublishRoute) -> Self {
        Self { broker, route }
    }

    pub fn route(&self) -> &PublishRoute {
        &self.route
    }
}

fn envelope_payload(envelope: &OutboxEnvelope) -> Result<Payload, BoxError> {
    match serde_json::to_value(envelope)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(format!("envelope serialized to non-object: {other}").into()),
    }
}

#[async_trait]
impl OutboxPublisher for BrokerPublisher {
    async fn publish(&self, envelope: &OutboxEnvelope) -> Result<(), BoxError> {
        let payload = envelope_payload(envelope)?;
        let headers: Headers = [
            ("event_type", &envelope.event_type),
            ("aggregate_type", &envelope.aggregate_type),
            ("aggregate_id", &envelope.aggregate_id),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();

        match &self.route {
            PublishRoute::AggregateType => {
                self.broker
                    .publish(&envelope.aggregate_type, payload, OUTBOX_SOURCE, headers)
                    .await?;
            }
            PublishRoute::Topic(topic) => {
                self.broker
                    .publish(topic, payload, OUTBOX_SOURCE, headers)
                    .await?;
            }
            PublishRoute::Queue(queue) => {
                self.broker
                    .send_to_queue(queue, payload, OUTBOX_SOURCE, headers)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Publisher that only logs, optionally keeping what it published.
///
/// Useful when no downstream is wired up yet, and in tests.
#[derive(Debug, Clone, Default)]
pub struct LogPublisher {
    published: Option<Arc<Mutex<Vec<OutboxEnvelope>>>>,
}

impl LogPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log and also record every envelope.
    pub fn recording() -> Self {
        Self {
            published: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// Envelopes published so far (empty unless recording).
    pub fn published(&self) -> Vec<OutboxEnvelope> {
        self.published
            .as_ref()
            .map(|buffer| {
                buffer
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl OutboxPublisher for LogPublisher {
    async fn publish(&self, envelope: &OutboxEnvelope) -> Result<(), BoxError> {
        info!(
            event_type = %envelope.event_type,
            aggregate_type = %envelope.aggregate_type,
            aggregate_id = %envelope.aggregate_id,
            "Outbox event published"
        );
        if let Some(buffer) = &self.published {
            buffer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(envelope.clone());
        }
        Ok(())
    }
}

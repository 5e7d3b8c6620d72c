//! In-memory message broker.
//!
//! This module contains:
//! - `MessageBroker`: point-to-point queues and pub/sub topics with
//!   retry, backoff and dead-lettering
//! - `MessageHandler` trait: topic subscriber callbacks
//! - `Message` / `Subscription`: broker records
//! - `outbox`: transactional outbox publishing into the broker
//!
//! Delivery is at-least-once. Consumers are expected to be idempotent.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::observer::BoxError;

pub mod broker;
pub mod message;
pub mod outbox;

pub use broker::{
    BrokerStats, MessageBroker, QueueInfo, SubscriberInfo, TopicInfo, HANDLER_PANICKED,
};
pub use message::{Message, MessageStatus, Subscription, DEFAULT_MAX_RETRIES};

// ============================================================================
// Types
// ============================================================================

/// Message body: a JSON object.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// String message headers.
pub type Headers = HashMap<String, String>;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("Invalid message status transition: {from} -> {to}")]
    InvalidTransition {
        from: MessageStatus,
        to: MessageStatus,
    },
}

/// Reject empty or whitespace-only queue and topic names.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(BusError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ============================================================================
// Traits
// ============================================================================

/// Handler for messages delivered from a topic.
///
/// An `Err` counts as a failed delivery and triggers a retry.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Arc<Message>) -> BoxFuture<'static, std::result::Result<(), BoxError>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    fn handle(&self, message: Arc<Message>) -> BoxFuture<'static, std::result::Result<(), BoxError>> {
        Box::pin(self(message))
    }
}

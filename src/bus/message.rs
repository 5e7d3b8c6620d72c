//! Broker message and subscription types.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BusError, Headers, MessageHandler, Payload, Result};
use crate::utils::ids;

/// Default retry budget carried by a new message.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Message lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::DeadLetter => "DEAD_LETTER",
        }
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, DeadLetter)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, DeadLetter)
                | (Failed, DeadLetter)
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message carried by a queue or delivered from a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub payload: Payload,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    /// Retries performed so far.
    pub retries: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub headers: Headers,
}

impl Message {
    pub fn new(payload: Payload, source: impl Into<String>, headers: Headers) -> Self {
        Self {
            id: ids::message_id(),
            payload,
            source: source.into(),
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error: None,
            headers,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Move to `to`, rejecting transitions outside the lifecycle.
    pub fn transition(&mut self, to: MessageStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(BusError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// A topic subscription.
pub struct Subscription {
    pub id: String,
    pub topic: String,
    pub max_retries: u32,
    handler: Arc<dyn MessageHandler>,
    active: AtomicBool,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, handler: Arc<dyn MessageHandler>, max_retries: u32) -> Self {
        Self {
            id: ids::subscription_id(),
            topic: topic.into(),
            max_retries,
            handler,
            active: AtomicBool::new(true),
        }
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("max_retries", &self.max_retries)
            .field("active", &self.is_active())
            .finish()
    }
}

//! Event sourcing storage.
//!
//! An append-only, per-aggregate event log with optimistic concurrency,
//! manual snapshots and synchronous projections. State is in memory only.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::Payload;
use crate::utils::ids;

pub mod event_store;

pub use event_store::{default_reducer, EventStore, EventStoreStats, Reducer};

/// Event type used when a caller supplies none.
pub const UNKNOWN_EVENT_TYPE: &str = "Unknown";

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;

/// Errors that can occur during event store operations.
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError {
    #[error(
        "Concurrency conflict on aggregate '{aggregate_id}': expected version {expected}, actual {actual}"
    )]
    Concurrency {
        aggregate_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid append: {0}")]
    InvalidAppend(String),
}

/// A stored event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub aggregate_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Payload,
    pub timestamp: DateTime<Utc>,
    /// 1-based, gap-free per aggregate.
    pub version: u64,
    pub metadata: HashMap<String, String>,
}

impl Event {
    pub(crate) fn from_new(aggregate_id: &str, version: u64, new: NewEvent) -> Self {
        Self {
            id: ids::event_id(),
            aggregate_id: aggregate_id.to_string(),
            event_type: new.event_type,
            data: new.data,
            timestamp: Utc::now(),
            version,
            metadata: new.metadata,
        }
    }
}

/// Input to [`EventStore::append`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: String,
    pub data: Payload,
    pub metadata: HashMap<String, String>,
}

impl Default for NewEvent {
    fn default() -> Self {
        Self {
            event_type: UNKNOWN_EVENT_TYPE.to_string(),
            data: Payload::new(),
            metadata: HashMap::new(),
        }
    }
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, data: Payload) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Point-in-time aggregate state checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: String,
    pub state: Payload,
    /// Aggregate version when the snapshot was taken.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

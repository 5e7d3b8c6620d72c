//! In-memory event store.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Event, EventStoreError, NewEvent, Result, Snapshot};
use crate::bus::Payload;
use crate::observer::{BoxError, Observers};

/// Folds one event into aggregate state.
pub type Reducer = dyn Fn(Payload, &Event) -> Payload + Send + Sync;

/// Shallow-merge `event.data` into `state` and stamp version bookkeeping.
pub fn default_reducer(mut state: Payload, event: &Event) -> Payload {
    for (key, value) in &event.data {
        state.insert(key.clone(), value.clone());
    }
    state.insert("_version".to_string(), Value::from(event.version));
    state.insert(
        "_last_updated".to_string(),
        Value::from(event.timestamp.to_rfc3339()),
    );
    state.insert(
        "_last_event_type".to_string(),
        Value::from(event.event_type.clone()),
    );
    state
}

/// Store summary returned by [`EventStore::get_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventStoreStats {
    pub total_events: usize,
    pub aggregates_count: usize,
    pub snapshots_count: usize,
    /// Distinct event types, sorted.
    pub event_types: Vec<String>,
}

#[derive(Default)]
struct StoreState {
    streams: HashMap<String, Vec<Event>>,
    global: Vec<Event>,
    snapshots: HashMap<String, Snapshot>,
}

impl StoreState {
    fn version(&self, aggregate_id: &str) -> u64 {
        self.streams
            .get(aggregate_id)
            .and_then(|events| events.last())
            .map_or(0, |event| event.version)
    }
}

/// Append-only event log keyed by aggregate id.
///
/// Versions per aggregate start at 1 and increase by exactly one per
/// append. The version check and the append happen under a single write
/// lock, so two writers racing on the same expected version cannot both
/// succeed.
pub struct EventStore {
    state: RwLock<StoreState>,
    projections: Observers<Event>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            projections: Observers::new("event_store"),
        }
    }

    /// Append an event to `aggregate_id`.
    ///
    /// With `expected_version`, the append fails with
    /// [`EventStoreError::Concurrency`] unless it equals the current version;
    /// the log is left untouched. Registered projections are invoked after
    /// the event is stored, in registration order.
    pub async fn append(
        &self,
        aggregate_id: &str,
        event: NewEvent,
        expected_version: Option<u64>,
    ) -> Result<Event> {
        if aggregate_id.trim().is_empty() {
            return Err(EventStoreError::InvalidAppend(
                "aggregate id must not be empty".to_string(),
            ));
        }

        let stored = {
            let mut state = self.state.write().await;
            let current = state.version(aggregate_id);

            if let Some(expected) = expected_version {
                if expected != current {
                    warn!(
                        aggregate_id = %aggregate_id,
                        expected,
                        actual = current,
                        "Concurrency conflict"
                    );
                    return Err(EventStoreError::Concurrency {
                        aggregate_id: aggregate_id.to_string(),
                        expected,
                        actual: current,
                    });
                }
            }

            let stored = Event::from_new(aggregate_id, current + 1, event);
            state
                .streams
                .entry(aggregate_id.to_string())
                .or_default()
                .push(stored.clone());
            state.global.push(stored.clone());
            stored
        };

        debug!(
            aggregate_id = %aggregate_id,
            event_type = %stored.event_type,
            version = stored.version,
            "Event appended"
        );
        self.projections.notify_all(&stored);
        Ok(stored)
    }

    /// Events of `aggregate_id` with `from_version <= version <= to_version`, ascending.
    pub async fn get_events(
        &self,
        aggregate_id: &str,
        from_version: u64,
        to_version: Option<u64>,
    ) -> Vec<Event> {
        let state = self.state.read().await;
        state
            .streams
            .get(aggregate_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.version >= from_version)
                    .filter(|e| to_version.map_or(true, |to| e.version <= to))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Current version of `aggregate_id`; 0 if it has no events.
    pub async fn get_current_version(&self, aggregate_id: &str) -> u64 {
        self.state.read().await.version(aggregate_id)
    }

    /// Rebuild aggregate state by folding events through `reducer`.
    ///
    /// Starts from the snapshot when one exists at or below `to_version`,
    /// replaying only the events after it. Otherwise starts from an empty
    /// map. `None` for the reducer uses [`default_reducer`].
    pub async fn rebuild_state(
        &self,
        aggregate_id: &str,
        reducer: Option<&Reducer>,
        to_version: Option<u64>,
    ) -> Payload {
        let (base, events) = {
            let state = self.state.read().await;
            let snapshot = state
                .snapshots
                .get(aggregate_id)
                .filter(|s| to_version.map_or(true, |to| s.version <= to));
            let (base, after) = match snapshot {
                Some(s) => (s.state.clone(), s.version),
                None => (Payload::new(), 0),
            };
            let events: Vec<Event> = state
                .streams
                .get(aggregate_id)
                .map(|events| {
                    events
                        .iter()
                        .filter(|e| e.version > after)
                        .filter(|e| to_version.map_or(true, |to| e.version <= to))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (base, events)
        };

        let reducer = reducer.unwrap_or(&default_reducer);
        events
            .iter()
            .fold(base, |state, event| reducer(state, event))
    }

    /// Checkpoint `state` at the aggregate's current version.
    ///
    /// Replaces any earlier snapshot. Later appends do not invalidate it.
    pub async fn create_snapshot(&self, aggregate_id: &str, state: Payload) -> Snapshot {
        let mut store = self.state.write().await;
        let snapshot = Snapshot {
            aggregate_id: aggregate_id.to_string(),
            state,
            version: store.version(aggregate_id),
            created_at: Utc::now(),
        };
        store
            .snapshots
            .insert(aggregate_id.to_string(), snapshot.clone());
        info!(aggregate_id = %aggregate_id, version = snapshot.version, "Snapshot created");
        snapshot
    }

    pub async fn get_snapshot(&self, aggregate_id: &str) -> Option<Snapshot> {
        self.state.read().await.snapshots.get(aggregate_id).cloned()
    }

    /// Register a projection invoked for every future append.
    ///
    /// Events appended before registration are not replayed. Projection
    /// errors are logged and never fail the append.
    pub fn register_projection<F>(&self, projection: F)
    where
        F: Fn(&Event) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.projections.register(Arc::new(projection));
    }

    /// The most recent `limit` events across all aggregates, oldest first.
    pub async fn get_global_stream(&self, limit: usize) -> Vec<Event> {
        let state = self.state.read().await;
        let skip = state.global.len().saturating_sub(limit);
        state.global[skip..].to_vec()
    }

    /// The most recent `limit` events of `event_type`, oldest first.
    pub async fn get_events_by_type(&self, event_type: &str, limit: usize) -> Vec<Event> {
        let state = self.state.read().await;
        let matching: Vec<&Event> = state
            .global
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching[skip..].iter().map(|e| (*e).clone()).collect()
    }

    pub async fn get_stats(&self) -> EventStoreStats {
        let state = self.state.read().await;
        let event_types: BTreeSet<&str> = state
            .global
            .iter()
            .map(|e| e.event_type.as_str())
            .collect();
        EventStoreStats {
            total_events: state.global.len(),
            aggregates_count: state.streams.len(),
            snapshots_count: state.snapshots.len(),
            event_types: event_types.into_iter().map(str::to_string).collect(),
        }
    }

    /// Drop every event and snapshot. Projections stay registered.
    pub async fn reset(&self) {
        *self.state.write().await = StoreState::default();
        info!("Event store reset");
    }
}

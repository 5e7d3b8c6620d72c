//! Transactional outbox for guaranteed event publication.
//!
//! The flow:
//!
//! 1. A business operation mutates its state and, in the same logical
//!    transaction, calls [`OutboxProcessor::add_entry`].
//! 2. A polling pass claims pending entries and hands each one to the
//!    configured [`OutboxPublisher`] (normally the broker).
//! 3. Success marks the entry published. Failure schedules a retry until
//!    `max_retries` is reached, after which the entry is marked failed and
//!    excluded from polling until [`OutboxProcessor::retry_failed`].
//!
//! Delivery is at-least-once: a crash between publish and the status update
//! republishes on the next pass. Consumers must be idempotent.
//!
//! # Configuration
//!
//! ```yaml
//! outbox:
//!   max_retries: 5
//!   poll_interval_ms: 1000
//!   route:
//!     type: topic
//!     name: domain-events
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Payload;
use crate::config::OutboxConfig;
use crate::observer::{BoxError, Notification, NotificationKind, Observers};
use crate::utils::ids;

mod publisher;

pub use publisher::{BrokerPublisher, LogPublisher, PublishRoute};

// ============================================================================
// Types
// ============================================================================

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Outbox entry not found: {0}")]
    NotFound(String),

    #[error("Invalid outbox status transition: {from} -> {to}")]
    InvalidTransition { from: OutboxStatus, to: OutboxStatus },
}

/// Outbox entry lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Published => "PUBLISHED",
            Self::Failed => "FAILED",
        }
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// `Processing -> Pending` is the retry path; `Failed -> Pending` is the
    /// manual retry path. `Published` is terminal.
    pub fn can_transition_to(&self, to: OutboxStatus) -> bool {
        use OutboxStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Published)
                | (Processing, Pending)
                | (Processing, Failed)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending or processed outbox record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Payload,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    /// Failed publish attempts so far.
    pub retries: u32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    fn new(aggregate_type: &str, aggregate_id: &str, event_type: &str, payload: Payload) -> Self {
        Self {
            id: ids::outbox_id(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            status: OutboxStatus::Pending,
            created_at: Utc::now(),
            published_at: None,
            retries: 0,
            last_error: None,
        }
    }

    fn transition(&mut self, to: OutboxStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(OutboxError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// The record handed to publishers.
    pub fn envelope(&self) -> OutboxEnvelope {
        OutboxEnvelope {
            event_type: self.event_type.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            payload: self.payload.clone(),
            timestamp: self.created_at,
        }
    }
}

/// Normalized publication record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub payload: Payload,
    /// When the entry was added to the outbox.
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one [`OutboxProcessor::process_pending`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessResult {
    pub published: usize,
    /// Failed this pass, back to pending for another attempt.
    pub retried: usize,
    /// Failed this pass and exhausted their retries.
    pub failed: usize,
}

/// Entry counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub published: usize,
    pub failed: usize,
}

// ============================================================================
// Publisher
// ============================================================================

/// Destination for outbox entries.
///
/// An `Err` counts as a failed attempt and the entry is retried.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, envelope: &OutboxEnvelope) -> std::result::Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> OutboxPublisher for F
where
    F: Fn(OutboxEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    async fn publish(&self, envelope: &OutboxEnvelope) -> std::result::Result<(), BoxError> {
        self(envelope.clone()).await
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Error recorded when a publisher panics.
pub const PUBLISHER_PANICKED: &str = "publisher panicked";

/// Sets the polling flag; clears it however the loop exits, including a
/// panic or an abort before the first poll.
struct PollingGuard(Arc<AtomicBool>);

impl PollingGuard {
    fn start(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::Release);
        Self(Arc::clone(flag))
    }
}

impl Drop for PollingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Outbox entries plus the polling loop that publishes them.
pub struct OutboxProcessor {
    config: OutboxConfig,
    entries: RwLock<Vec<OutboxEntry>>,
    publisher: Arc<dyn OutboxPublisher>,
    observers: Observers<Notification>,
    stop: watch::Sender<bool>,
    polling: Arc<AtomicBool>,
}

impl OutboxProcessor {
    pub fn new(config: OutboxConfig, publisher: Arc<dyn OutboxPublisher>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            config,
            entries: RwLock::new(Vec::new()),
            publisher,
            observers: Observers::new("outbox"),
            stop,
            polling: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Register an observer for outbox notifications.
    pub fn on_event<F>(&self, observer: F)
    where
        F: Fn(&Notification) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.observers.register(Arc::new(observer));
    }

    fn emit(&self, kind: NotificationKind, data: serde_json::Value) {
        self.observers.notify_all(&Notification::new(kind, data));
    }

    /// Record an event for publication.
    ///
    /// Call in the same logical transaction as the business mutation it
    /// describes.
    pub async fn add_entry(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
        payload: Payload,
    ) -> OutboxEntry {
        let entry = OutboxEntry::new(aggregate_type, aggregate_id, event_type, payload);
        self.entries.write().await.push(entry.clone());

        debug!(entry_id = %entry.id, event_type = %event_type, "Outbox entry added");
        self.emit(
            NotificationKind::OutboxEntryAdded,
            json!({
                "entry_id": entry.id,
                "aggregate_type": aggregate_type,
                "aggregate_id": aggregate_id,
                "event_type": event_type,
            }),
        );
        entry
    }

    /// Publish every pending entry once, in insertion order.
    ///
    /// Entries are claimed (`Processing`) before any publish call, so
    /// overlapping passes never publish the same entry twice. The lock is
    /// not held while publishing.
    #[tracing::instrument(name = "outbox.process_pending", skip_all)]
    pub async fn process_pending(&self) -> ProcessResult {
        let claimed: Vec<OutboxEntry> = {
            let mut entries = self.entries.write().await;
            entries
                .iter_mut()
                .filter(|e| e.status == OutboxStatus::Pending)
                .filter_map(|e| e.transition(OutboxStatus::Processing).ok().map(|_| e.clone()))
                .collect()
        };

        let mut result = ProcessResult::default();
        for entry in claimed {
            self.emit(
                NotificationKind::OutboxProcessing,
                json!({ "entry_id": entry.id }),
            );

            let envelope = entry.envelope();
            // a panicking publisher counts as a failed attempt
            let outcome = AssertUnwindSafe(async { self.publisher.publish(&envelope).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(PUBLISHER_PANICKED.into()));
            match self.record_outcome(&entry.id, outcome).await {
                Some(OutboxStatus::Published) => result.published += 1,
                Some(OutboxStatus::Pending) => result.retried += 1,
                Some(OutboxStatus::Failed) => result.failed += 1,
                _ => {}
            }
        }

        if result != ProcessResult::default() {
            info!(
                published = result.published,
                retried = result.retried,
                failed = result.failed,
                "Outbox pass complete"
            );
        }
        result
    }

    /// Apply a publish outcome to the entry. Returns its new status, or
    /// `None` if the entry vanished (reset) while publishing.
    async fn record_outcome(
        &self,
        entry_id: &str,
        outcome: std::result::Result<(), BoxError>,
    ) -> Option<OutboxStatus> {
        let max_retries = self.config.max_retries;
        let (status, notification) = {
            let mut entries = self.entries.write().await;
            let entry = entries.iter_mut().find(|e| e.id == entry_id)?;

            let (to, notification) = match outcome {
                Ok(()) => {
                    entry.published_at = Some(Utc::now());
                    (
                        OutboxStatus::Published,
                        (
                            NotificationKind::OutboxPublished,
                            json!({ "entry_id": entry.id, "event_type": entry.event_type }),
                        ),
                    )
                }
                Err(e) => {
                    let error = e.to_string();
                    entry.retries += 1;
                    entry.last_error = Some(error.clone());
                    if entry.retries < max_retries {
                        warn!(entry_id = %entry.id, retry = entry.retries, error = %error, "Outbox publish failed, will retry");
                        (
                            OutboxStatus::Pending,
                            (
                                NotificationKind::OutboxRetryScheduled,
                                json!({ "entry_id": entry.id, "retry": entry.retries }),
                            ),
                        )
                    } else {
                        error!(entry_id = %entry.id, retries = entry.retries, error = %error, "Outbox entry failed");
                        (
                            OutboxStatus::Failed,
                            (
                                NotificationKind::OutboxFailed,
                                json!({
                                    "entry_id": entry.id,
                                    "error": error,
                                    "retries": entry.retries,
                                }),
                            ),
                        )
                    }
                }
            };

            if let Err(e) = entry.transition(to) {
                warn!(entry_id = %entry_id, error = %e, "Outbox entry changed while publishing");
                return None;
            }
            (to, notification)
        };

        self.emit(notification.0, notification.1);
        Some(status)
    }

    /// Call [`process_pending`](Self::process_pending) every poll interval
    /// until [`stop_polling`](Self::stop_polling).
    ///
    /// Stop is observed between passes; an in-flight pass completes.
    pub async fn run_polling(&self) {
        self.stop.send_replace(false);
        let _polling = PollingGuard::start(&self.polling);
        self.poll_loop().await;
    }

    /// Run the polling loop on a background task.
    pub fn spawn_polling(self: &Arc<Self>) -> JoinHandle<()> {
        self.stop.send_replace(false);
        let polling = PollingGuard::start(&self.polling);
        let outbox = Arc::clone(self);
        tokio::spawn(async move {
            let _polling = polling;
            outbox.poll_loop().await
        })
    }

    async fn poll_loop(&self) {
        let mut stop_rx = self.stop.subscribe();
        let interval = self.config.poll_interval();
        info!(interval_ms = self.config.poll_interval_ms, "Outbox polling started");

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            self.process_pending().await;

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Outbox polling stopped");
    }

    /// Signal the polling loop to stop.
    pub fn stop_polling(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::Acquire)
    }

    /// Return a failed entry to pending with a fresh retry budget.
    pub async fn retry_failed(&self, entry_id: &str) -> Result<OutboxEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| OutboxError::NotFound(entry_id.to_string()))?;

        if entry.status != OutboxStatus::Failed {
            return Err(OutboxError::InvalidTransition {
                from: entry.status,
                to: OutboxStatus::Pending,
            });
        }
        entry.transition(OutboxStatus::Pending)?;
        entry.retries = 0;
        entry.last_error = None;

        info!(entry_id = %entry_id, "Outbox entry requeued");
        Ok(entry.clone())
    }

    /// Delete published entries older than `older_than_hours`. Returns the count.
    ///
    /// Age is measured from `published_at` against the current UTC time.
    pub async fn purge_published(&self, older_than_hours: f64) -> usize {
        if older_than_hours.is_nan() || older_than_hours < 0.0 {
            warn!(older_than_hours, "Ignoring purge with invalid age");
            return 0;
        }
        let age = chrono::Duration::try_milliseconds((older_than_hours * 3_600_000.0) as i64)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| {
            !(e.status == OutboxStatus::Published && e.published_at.map_or(false, |at| at <= cutoff))
        });
        let purged = before - entries.len();
        if purged > 0 {
            info!(purged, older_than_hours, "Purged published outbox entries");
        }
        purged
    }

    pub async fn get_entry(&self, entry_id: &str) -> Option<OutboxEntry> {
        self.entries
            .read()
            .await
            .iter()
            .find(|e| e.id == entry_id)
            .cloned()
    }

    /// All entries, in insertion order.
    pub async fn get_all_entries(&self) -> Vec<OutboxEntry> {
        self.entries.read().await.clone()
    }

    pub async fn get_pending_entries(&self) -> Vec<OutboxEntry> {
        self.entries_with(OutboxStatus::Pending).await
    }

    pub async fn get_failed_entries(&self) -> Vec<OutboxEntry> {
        self.entries_with(OutboxStatus::Failed).await
    }

    async fn entries_with(&self, status: OutboxStatus) -> Vec<OutboxEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }

    pub async fn get_stats(&self) -> OutboxStats {
        let entries = self.entries.read().await;
        let count = |status| entries.iter().filter(|e| e.status == status).count();
        OutboxStats {
            total: entries.len(),
            pending: count(OutboxStatus::Pending),
            processing: count(OutboxStatus::Processing),
            published: count(OutboxStatus::Published),
            failed: count(OutboxStatus::Failed),
        }
    }

    /// Drop every entry. A running polling loop keeps running.
    pub async fn reset(&self) {
        self.entries.write().await.clear();
        info!("Outbox reset");
    }
}

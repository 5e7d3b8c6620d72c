//! Observer lists and lifecycle notifications.
//!
//! Every component exposes the same hook: callers register observers and the
//! component fans each notification out to them in registration order.
//! A failing or panicking observer is logged and skipped; it never affects
//! the other observers or the operation that emitted the notification.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

/// Error type for user-supplied callbacks (handlers, projections, observers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A callback notified with `&T`.
pub trait Observer<T>: Send + Sync {
    fn notify(&self, item: &T) -> Result<(), BoxError>;
}

impl<T, F> Observer<T> for F
where
    F: Fn(&T) -> Result<(), BoxError> + Send + Sync,
{
    fn notify(&self, item: &T) -> Result<(), BoxError> {
        self(item)
    }
}

/// Ordered list of observers.
pub struct Observers<T> {
    label: &'static str,
    observers: RwLock<Vec<Arc<dyn Observer<T>>>>,
}

impl<T> Observers<T> {
    /// `label` identifies the owning component in log output.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            observers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, observer: Arc<dyn Observer<T>>) {
        match self.observers.write() {
            Ok(mut guard) => guard.push(observer),
            Err(poisoned) => poisoned.into_inner().push(observer),
        }
    }

    pub fn len(&self) -> usize {
        match self.observers.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notify every observer with `item`.
    ///
    /// The list is snapshotted first so observers may register further
    /// observers without deadlocking.
    pub fn notify_all(&self, item: &T) {
        let snapshot: Vec<Arc<dyn Observer<T>>> = match self.observers.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for (index, observer) in snapshot.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| observer.notify(item))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(component = self.label, observer = index, error = %e, "Observer failed");
                }
                Err(_) => {
                    warn!(component = self.label, observer = index, "Observer panicked");
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("label", &self.label)
            .field("count", &self.len())
            .finish()
    }
}

/// Kinds of lifecycle notification emitted by the broker, outbox and sagas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    // Broker
    QueueMessage,
    QueueReceive,
    TopicPublish,
    TopicSubscribe,
    TopicUnsubscribe,
    TopicDelivered,
    TopicDeliveryFailed,
    DlqMessage,
    // Outbox
    OutboxEntryAdded,
    OutboxProcessing,
    OutboxPublished,
    OutboxRetryScheduled,
    OutboxFailed,
    // Saga
    SagaStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    CompensationStarted,
    StepCompensated,
    CompensationFailed,
    SagaCompleted,
    SagaCompensated,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueMessage => "queue_message",
            Self::QueueReceive => "queue_receive",
            Self::TopicPublish => "topic_publish",
            Self::TopicSubscribe => "topic_subscribe",
            Self::TopicUnsubscribe => "topic_unsubscribe",
            Self::TopicDelivered => "topic_delivered",
            Self::TopicDeliveryFailed => "topic_delivery_failed",
            Self::DlqMessage => "dlq_message",
            Self::OutboxEntryAdded => "outbox_entry_added",
            Self::OutboxProcessing => "outbox_processing",
            Self::OutboxPublished => "outbox_published",
            Self::OutboxRetryScheduled => "outbox_retry_scheduled",
            Self::OutboxFailed => "outbox_failed",
            Self::SagaStarted => "saga_started",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::CompensationStarted => "compensation_started",
            Self::StepCompensated => "step_compensated",
            Self::CompensationFailed => "compensation_failed",
            Self::SagaCompleted => "saga_completed",
            Self::SagaCompensated => "saga_compensated",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle notification.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_observers_called_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observers: Observers<u32> = Observers::new("test");

        for tag in ["a", "b"] {
            let seen = seen.clone();
            observers.register(Arc::new(move |n: &u32| -> Result<(), BoxError> {
                seen.lock().unwrap().push(format!("{tag}{n}"));
                Ok(())
            }));
        }

        observers.notify_all(&7);
        assert_eq!(*seen.lock().unwrap(), vec!["a7", "b7"]);
    }

    #[test]
    fn test_failing_observer_does_not_stop_others() {
        let count = Arc::new(Mutex::new(0));
        let observers: Observers<()> = Observers::new("test");

        observers.register(Arc::new(|_: &()| -> Result<(), BoxError> {
            Err("boom".into())
        }));
        observers.register(Arc::new(|_: &()| -> Result<(), BoxError> {
            panic!("observer panic")
        }));
        let counter = count.clone();
        observers.register(Arc::new(move |_: &()| -> Result<(), BoxError> {
            *counter.lock().unwrap() += 1;
            Ok(())
        }));

        observers.notify_all(&());
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(observers.len(), 3);
    }

    #[test]
    fn test_notification_kind_serializes_snake_case() {
        let n = Notification::new(NotificationKind::TopicDeliveryFailed, serde_json::json!({}));
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["type"], "topic_delivery_failed");
        assert_eq!(
            NotificationKind::OutboxRetryScheduled.to_string(),
            "outbox_retry_scheduled"
        );
    }
}

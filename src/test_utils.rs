//! Test utilities: recording handlers, payload builders, polling helpers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::bus::{Message, MessageHandler, Payload};
use crate::observer::{BoxError, Notification, NotificationKind};

/// Build a payload from a JSON object literal.
pub fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("payload must be a JSON object, got {other}"),
    }
}

/// Handler that records every delivered message and fails the first
/// `failures` attempts.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    calls: Arc<AtomicUsize>,
    failures: usize,
    received: Arc<Mutex<Vec<Message>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `failures` attempts, then succeed.
    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    /// Never succeed.
    pub fn always_failing() -> Self {
        Self::failing(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }
}

impl MessageHandler for RecordingHandler {
    fn handle(&self, message: Arc<Message>) -> BoxFuture<'static, Result<(), BoxError>> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        let failures = self.failures;
        let received = self.received.clone();
        Box::pin(async move {
            if attempt < failures {
                return Err(format!("attempt {} failed", attempt + 1).into());
            }
            received.lock().unwrap().push((*message).clone());
            Ok(())
        })
    }
}

/// Shared sink of notifications for `on_event` observers.
#[derive(Clone, Default)]
pub struct NotificationSink {
    seen: Arc<Mutex<Vec<Notification>>>,
}

impl NotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observer(&self) -> impl Fn(&Notification) -> Result<(), BoxError> + Send + Sync + 'static {
        let seen = self.seen.clone();
        move |n: &Notification| {
            seen.lock().unwrap().push(n.clone());
            Ok::<(), BoxError>(())
        }
    }

    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.all().into_iter().map(|n| n.kind).collect()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.all().iter().filter(|n| n.kind == kind).count()
    }
}

/// Poll `condition` every few milliseconds until it holds or `within` elapses.
pub async fn wait_for(within: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

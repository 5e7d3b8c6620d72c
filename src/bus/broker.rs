//! Queue and topic broker.
//!
//! Queues are point-to-point: each message is received by exactly one
//! consumer, in send order. Topics fan out: every active subscription gets
//! its own copy, delivered on its own tokio task with independent retries.
//! A subscription that exhausts its retries routes the message to the
//! topic's DLQ.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use backon::BackoffBuilder;
use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::message::Subscription;
use super::{validate_name, Headers, Message, MessageHandler, MessageStatus, Payload, Result};
use crate::config::BrokerConfig;
use crate::dlq::DeadLetterQueues;
use crate::observer::{BoxError, Notification, NotificationKind, Observers};
use crate::utils::retry::RetryPolicy;

/// Delivery error recorded when a subscription handler panics.
pub const HANDLER_PANICKED: &str = "handler panicked";

// ============================================================================
// Reporting types
// ============================================================================

/// Queue summary returned by [`MessageBroker::list_queues`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub size: usize,
    pub dlq_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberInfo {
    pub id: String,
    pub active: bool,
}

/// Topic summary returned by [`MessageBroker::list_topics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicInfo {
    pub name: String,
    pub subscribers: Vec<SubscriberInfo>,
}

/// Broker counters and registry summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_failed: u64,
    pub messages_dlq: u64,
    pub queues: Vec<String>,
    pub topics: Vec<String>,
    pub dlqs: Vec<String>,
    pub active_subscriptions: usize,
}

// ============================================================================
// Internal state
// ============================================================================

/// FIFO for one queue plus a wake-up for blocked receivers.
#[derive(Default)]
struct QueueChannel {
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl QueueChannel {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, message: Message) {
        self.lock().push_back(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        self.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

#[derive(Default)]
struct Registry {
    queues: HashMap<String, Arc<QueueChannel>>,
    /// Every message ever sent to each queue, for inspection.
    queue_logs: HashMap<String, Vec<Message>>,
    topics: HashMap<String, Vec<Arc<Subscription>>>,
    history: VecDeque<Message>,
}

impl Registry {
    fn channel(&mut self, queue: &str) -> Arc<QueueChannel> {
        self.queues.entry(queue.to_string()).or_default().clone()
    }

    fn record(&mut self, message: &Message, limit: usize) {
        self.history.push_back(message.clone());
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    failed: AtomicU64,
    dlq: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [&self.sent, &self.received, &self.failed, &self.dlq] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

struct BrokerInner {
    config: BrokerConfig,
    policy: RetryPolicy,
    registry: RwLock<Registry>,
    dead_letters: DeadLetterQueues,
    counters: Counters,
    observers: Observers<Notification>,
}

// ============================================================================
// Broker
// ============================================================================

/// In-memory message broker.
///
/// Cheap to clone; all clones share the same queues, topics and DLQs.
#[derive(Clone)]
pub struct MessageBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MessageBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl std::fmt::Debug for MessageBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBroker")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl MessageBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let policy = RetryPolicy::from_broker_config(&config);
        Self {
            inner: Arc::new(BrokerInner {
                config,
                policy,
                registry: RwLock::new(Registry::default()),
                dead_letters: DeadLetterQueues::new(),
                counters: Counters::default(),
                observers: Observers::new("broker"),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Register an observer for broker notifications.
    pub fn on_event<F>(&self, observer: F)
    where
        F: Fn(&Notification) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.inner.observers.register(Arc::new(observer));
    }

    fn emit(&self, kind: NotificationKind, data: serde_json::Value) {
        self.inner.observers.notify_all(&Notification::new(kind, data));
    }

    // ------------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------------

    /// Enqueue a message on `queue`, creating the queue on first use.
    pub async fn send_to_queue(
        &self,
        queue: &str,
        payload: Payload,
        source: &str,
        headers: Headers,
    ) -> Result<Message> {
        validate_name(queue)?;
        let message = Message::new(payload, source, headers)
            .with_max_retries(self.inner.config.default_max_retries);

        {
            let mut registry = self.inner.registry.write().await;
            registry
                .queue_logs
                .entry(queue.to_string())
                .or_default()
                .push(message.clone());
            registry.record(&message, self.inner.config.history_limit);
            registry.channel(queue).push(message.clone());
        }

        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %queue, message_id = %message.id, "Message queued");
        self.emit(
            NotificationKind::QueueMessage,
            json!({ "queue": queue, "message_id": message.id, "source": source }),
        );

        Ok(message)
    }

    /// Wait up to `timeout` for the next message on `queue`.
    ///
    /// Returns `Ok(None)` on timeout. A received message is marked
    /// `Processing` and is not redelivered.
    pub async fn receive_from_queue(&self, queue: &str, timeout: Duration) -> Result<Option<Message>> {
        validate_name(queue)?;
        let channel = self.inner.registry.write().await.channel(queue);
        let deadline = Instant::now() + timeout;

        loop {
            let notified = channel.notify.notified();

            if let Some(mut message) = channel.pop() {
                message.transition(MessageStatus::Processing)?;
                self.inner.counters.received.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %queue, message_id = %message.id, "Message received");
                self.emit(
                    NotificationKind::QueueReceive,
                    json!({ "queue": queue, "message_id": message.id }),
                );
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(queue = %queue, ?timeout, "Receive timed out");
                return Ok(None);
            }
        }
    }

    /// [`receive_from_queue`](Self::receive_from_queue) with the configured timeout.
    pub async fn receive_from_queue_default(&self, queue: &str) -> Result<Option<Message>> {
        self.receive_from_queue(queue, self.inner.config.receive_timeout())
            .await
    }

    pub async fn get_queue_size(&self, queue: &str) -> usize {
        self.inner
            .registry
            .read()
            .await
            .queues
            .get(queue)
            .map_or(0, |channel| channel.len())
    }

    /// The most recent `limit` messages sent to `queue`, oldest first.
    pub async fn get_queue_messages(&self, queue: &str, limit: usize) -> Vec<Message> {
        let registry = self.inner.registry.read().await;
        registry
            .queue_logs
            .get(queue)
            .map(|log| log[log.len().saturating_sub(limit)..].to_vec())
            .unwrap_or_default()
    }

    pub async fn list_queues(&self) -> Vec<QueueInfo> {
        let registry = self.inner.registry.read().await;
        let mut queues: Vec<QueueInfo> = registry
            .queues
            .iter()
            .map(|(name, channel)| QueueInfo {
                name: name.clone(),
                size: channel.len(),
                dlq_size: self.inner.dead_letters.size(name),
            })
            .collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        queues
    }

    // ------------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------------

    /// Subscribe `handler` to `topic` with an explicit retry budget.
    ///
    /// Returns the subscription id.
    pub async fn subscribe<H>(&self, topic: &str, handler: H, max_retries: u32) -> Result<String>
    where
        H: MessageHandler + 'static,
    {
        validate_name(topic)?;
        let subscription = Arc::new(Subscription::new(topic, Arc::new(handler), max_retries));
        let id = subscription.id.clone();

        self.inner
            .registry
            .write()
            .await
            .topics
            .entry(topic.to_string())
            .or_default()
            .push(subscription);

        info!(topic = %topic, subscription_id = %id, max_retries, "Subscribed");
        self.emit(
            NotificationKind::TopicSubscribe,
            json!({ "topic": topic, "subscription_id": id }),
        );
        Ok(id)
    }

    /// Subscribe with the configured default retry budget.
    pub async fn subscribe_default<H>(&self, topic: &str, handler: H) -> Result<String>
    where
        H: MessageHandler + 'static,
    {
        self.subscribe(topic, handler, self.inner.config.default_max_retries)
            .await
    }

    /// Deactivate and remove a subscription. Returns false if unknown.
    ///
    /// Deliveries already in flight run to completion.
    pub async fn unsubscribe(&self, topic: &str, subscription_id: &str) -> bool {
        let removed = {
            let mut registry = self.inner.registry.write().await;
            let Some(subscriptions) = registry.topics.get_mut(topic) else {
                return false;
            };
            match subscriptions.iter().position(|s| s.id == subscription_id) {
                Some(index) => {
                    let subscription = subscriptions.remove(index);
                    subscription.deactivate();
                    true
                }
                None => false,
            }
        };

        if removed {
            info!(topic = %topic, subscription_id = %subscription_id, "Unsubscribed");
            self.emit(
                NotificationKind::TopicUnsubscribe,
                json!({ "topic": topic, "subscription_id": subscription_id }),
            );
        }
        removed
    }

    pub async fn list_topics(&self) -> Vec<TopicInfo> {
        let registry = self.inner.registry.read().await;
        let mut topics: Vec<TopicInfo> = registry
            .topics
            .iter()
            .map(|(name, subscriptions)| TopicInfo {
                name: name.clone(),
                subscribers: subscriptions
                    .iter()
                    .map(|s| SubscriberInfo {
                        id: s.id.clone(),
                        active: s.is_active(),
                    })
                    .collect(),
            })
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        topics
    }

    /// Publish to every active subscription of `topic`.
    ///
    /// Returns as soon as one delivery task per subscriber is spawned.
    #[tracing::instrument(name = "broker.publish", skip_all, fields(topic = %topic))]
    pub async fn publish(
        &self,
        topic: &str,
        payload: Payload,
        source: &str,
        headers: Headers,
    ) -> Result<Message> {
        validate_name(topic)?;
        let message = Message::new(payload, source, headers);

        let subscribers: Vec<Arc<Subscription>> = {
            let mut registry = self.inner.registry.write().await;
            registry.record(&message, self.inner.config.history_limit);
            registry
                .topics
                .entry(topic.to_string())
                .or_default()
                .iter()
                .filter(|s| s.is_active())
                .cloned()
                .collect()
        };

        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        debug!(message_id = %message.id, subscribers = subscribers.len(), "Publishing");
        self.emit(
            NotificationKind::TopicPublish,
            json!({
                "topic": topic,
                "message_id": message.id,
                "subscribers_count": subscribers.len(),
            }),
        );

        for subscription in subscribers {
            let broker = self.clone();
            let topic = topic.to_string();
            let delivered = message.clone().with_max_retries(subscription.max_retries);
            tokio::spawn(async move {
                broker.deliver(topic, subscription, delivered).await;
            });
        }

        Ok(message)
    }

    /// Deliver one message to one subscription, retrying with backoff.
    async fn deliver(&self, topic: String, subscription: Arc<Subscription>, mut message: Message) {
        let mut delays = self
            .inner
            .policy
            .with_max_retries(subscription.max_retries)
            .backoff()
            .build();

        if let Err(e) = message.transition(MessageStatus::Processing) {
            warn!(error = %e, message_id = %message.id, "Unexpected message status");
        }

        loop {
            let delivered = Arc::new(message.clone());
            // a panicking handler counts as a failed attempt
            let attempt = AssertUnwindSafe(async { subscription.handler().handle(delivered).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(HANDLER_PANICKED.into()));
            match attempt {
                Ok(()) => {
                    self.inner.counters.received.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        topic = %topic,
                        subscription_id = %subscription.id,
                        message_id = %message.id,
                        retries = message.retries,
                        "Message delivered"
                    );
                    self.emit(
                        NotificationKind::TopicDelivered,
                        json!({
                            "topic": topic,
                            "subscription_id": subscription.id,
                            "message_id": message.id,
                            "retries": message.retries,
                        }),
                    );
                    return;
                }
                Err(e) => {
                    let error = e.to_string();
                    self.emit(
                        NotificationKind::TopicDeliveryFailed,
                        json!({
                            "topic": topic,
                            "subscription_id": subscription.id,
                            "message_id": message.id,
                            "retry": message.retries,
                            "error": error,
                        }),
                    );

                    match delays.next() {
                        Some(delay) => {
                            message.retries += 1;
                            warn!(
                                topic = %topic,
                                subscription_id = %subscription.id,
                                message_id = %message.id,
                                retry = message.retries,
                                max_retries = subscription.max_retries,
                                ?delay,
                                error = %error,
                                "Delivery failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            if let Err(e) = message.transition(MessageStatus::DeadLetter) {
                                warn!(error = %e, message_id = %message.id, "Unexpected message status");
                            }
                            self.route_to_dlq(&topic, message, error);
                            return;
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Dead letters
    // ------------------------------------------------------------------------

    fn route_to_dlq(&self, source: &str, mut message: Message, error: String) {
        message.error = Some(error.clone());
        let message_id = message.id.clone();
        let retries = message.retries;
        let dlq = self.inner.dead_letters.push(source, message);

        self.inner.counters.dlq.fetch_add(1, Ordering::Relaxed);
        self.inner.counters.failed.fetch_add(1, Ordering::Relaxed);
        error!(
            source = %source,
            dlq = %dlq,
            message_id = %message_id,
            retries,
            error = %error,
            "Message dead-lettered"
        );
        self.emit(
            NotificationKind::DlqMessage,
            json!({
                "source": source,
                "dlq": dlq,
                "message_id": message_id,
                "retries": retries,
                "error": error,
            }),
        );
    }

    /// Dead-letter a message a queue consumer could not process.
    pub fn dead_letter(&self, source: &str, mut message: Message, error: &str) -> Result<Message> {
        validate_name(source)?;
        message.transition(MessageStatus::DeadLetter)?;
        let routed = Message {
            error: Some(error.to_string()),
            ..message.clone()
        };
        self.route_to_dlq(source, message, error.to_string());
        Ok(routed)
    }

    /// Pop the oldest dead-lettered message for `source`.
    pub fn receive_from_dlq(&self, source: &str) -> Option<Message> {
        self.inner.dead_letters.pop(source)
    }

    pub fn get_dlq_size(&self, source: &str) -> usize {
        self.inner.dead_letters.size(source)
    }

    /// The most recent `limit` dead-lettered messages for `source`, oldest first.
    pub fn get_dlq_messages(&self, source: &str, limit: usize) -> Vec<Message> {
        self.inner.dead_letters.messages(source, limit)
    }

    // ------------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------------

    pub async fn get_stats(&self) -> BrokerStats {
        let registry = self.inner.registry.read().await;
        let mut queues: Vec<String> = registry.queues.keys().cloned().collect();
        queues.sort();
        let mut topics: Vec<String> = registry.topics.keys().cloned().collect();
        topics.sort();
        let active_subscriptions = registry
            .topics
            .values()
            .flatten()
            .filter(|s| s.is_active())
            .count();

        let counters = &self.inner.counters;
        BrokerStats {
            messages_sent: counters.sent.load(Ordering::Relaxed),
            messages_received: counters.received.load(Ordering::Relaxed),
            messages_failed: counters.failed.load(Ordering::Relaxed),
            messages_dlq: counters.dlq.load(Ordering::Relaxed),
            queues,
            topics,
            dlqs: self.inner.dead_letters.names(),
            active_subscriptions,
        }
    }

    /// The most recent `limit` sent or published messages, oldest first.
    pub async fn get_message_history(&self, limit: usize) -> Vec<Message> {
        let registry = self.inner.registry.read().await;
        let skip = registry.history.len().saturating_sub(limit);
        registry.history.iter().skip(skip).cloned().collect()
    }

    /// Drop every queue, topic, DLQ, history entry and counter.
    ///
    /// Delivery tasks already running are not cancelled.
    pub async fn reset(&self) {
        {
            let mut registry = self.inner.registry.write().await;
            for subscription in registry.topics.values().flatten() {
                subscription.deactivate();
            }
            *registry = Registry::default();
        }
        self.inner.dead_letters.clear();
        self.inner.counters.reset();
        info!("Broker reset");
    }
}

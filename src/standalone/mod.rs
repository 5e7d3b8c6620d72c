//! Standalone composition root.
//!
//! [`IntegrationRuntime`] owns one broker, one event store and one outbox
//! wired to the broker. Consumers get handles from it; nothing is global.
//!
//! ```text
//! IntegrationRuntime
//!     ├── EventStore            (append-only log, snapshots, projections)
//!     ├── OutboxProcessor ──→ BrokerPublisher ──→ MessageBroker
//!     └── saga(name)        ──→ SagaOrchestrator (configured step timeout)
//! ```

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::outbox::{BrokerPublisher, OutboxEntry, OutboxProcessor, PublishRoute};
use crate::bus::{MessageBroker, Payload};
use crate::config::Config;
use crate::orchestration::SagaOrchestrator;
use crate::storage::{self, Event, EventStore, NewEvent};

/// In-process runtime hosting every integration component.
pub struct IntegrationRuntime {
    config: Config,
    broker: MessageBroker,
    event_store: Arc<EventStore>,
    outbox: Arc<OutboxProcessor>,
    polling_task: Mutex<Option<JoinHandle<()>>>,
}

impl IntegrationRuntime {
    pub fn new(config: Config) -> Self {
        let broker = MessageBroker::new(config.broker.clone());
        let route = PublishRoute::from(&config.outbox.route);
        let publisher = BrokerPublisher::new(broker.clone(), route);
        let outbox = Arc::new(OutboxProcessor::new(
            config.outbox.clone(),
            Arc::new(publisher),
        ));

        Self {
            config,
            broker,
            event_store: Arc::new(EventStore::new()),
            outbox,
            polling_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    pub fn event_store(&self) -> Arc<EventStore> {
        self.event_store.clone()
    }

    pub fn outbox(&self) -> Arc<OutboxProcessor> {
        self.outbox.clone()
    }

    /// Build a saga orchestrator using the configured step timeout.
    pub fn saga(&self, name: &str) -> SagaOrchestrator {
        let saga = SagaOrchestrator::new(name);
        match self.config.saga.step_timeout() {
            Some(timeout) => saga.with_step_timeout(timeout),
            None => saga,
        }
    }

    /// Append an event and stage it in the outbox for publication.
    ///
    /// Nothing is staged when the append is rejected.
    pub async fn record_event(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        event: NewEvent,
        expected_version: Option<u64>,
    ) -> storage::Result<(Event, OutboxEntry)> {
        let stored = self
            .event_store
            .append(aggregate_id, event, expected_version)
            .await?;

        let payload: Payload = stored.data.clone();
        let entry = self
            .outbox
            .add_entry(aggregate_type, aggregate_id, &stored.event_type, payload)
            .await;
        Ok((stored, entry))
    }

    /// Start background work. Outbox polling runs only when enabled.
    pub async fn start(&self) {
        if !self.config.outbox.polling_enabled {
            info!("Outbox polling disabled");
            return;
        }

        let mut task = self.polling_task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *task = Some(self.outbox.spawn_polling());
        info!(
            interval_ms = self.config.outbox.poll_interval_ms,
            "Runtime started"
        );
    }

    /// Remove published outbox entries older than `purge_after_hours`.
    pub async fn purge_outbox(&self) -> usize {
        self.outbox
            .purge_published(self.config.outbox.purge_after_hours)
            .await
    }

    /// Stop outbox polling and wait for the loop to exit.
    pub async fn shutdown(&self) {
        self.outbox.stop_polling();
        let task = self.polling_task.lock().await.take();
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                warn!(error = %e, "Outbox polling task ended abnormally");
            }
        }
        info!("Runtime stopped");
    }
}

impl std::fmt::Debug for IntegrationRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationRuntime")
            .field("config", &self.config)
            .field("broker", &self.broker)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests;

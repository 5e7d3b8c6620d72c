//! Courier - in-process integration infrastructure
//!
//! An asynchronous message broker (queues, topics, dead letter queues),
//! an append-only event store with snapshots and projections, a
//! transactional outbox, and a saga orchestrator with compensation.

pub mod bus;
pub mod config;
pub mod dlq;
pub mod observer;
pub mod orchestration;
pub mod standalone;
pub mod storage;
pub mod utils;

#[cfg(test)]
mod test_utils;

pub use bus::outbox::{OutboxEntry, OutboxProcessor, OutboxStatus};
pub use bus::{Message, MessageBroker, MessageStatus};
pub use config::Config;
pub use observer::{Notification, NotificationKind};
pub use orchestration::{SagaExecution, SagaOrchestrator, SagaStatus, SagaStep};
pub use standalone::IntegrationRuntime;
pub use storage::{Event, EventStore, NewEvent, Snapshot};

//! Dead Letter Queue (DLQ) storage.
//!
//! Messages that exhaust their retries, or that a consumer explicitly
//! rejects, are parked here for manual review and replay.
//!
//! ## Naming
//!
//! Each source queue or topic gets its own DLQ: `{source}.dlq`.
//! DLQs are strictly FIFO.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::bus::Message;

/// Suffix appended to a source name to form its DLQ name.
pub const DLQ_SUFFIX: &str = ".dlq";

/// Build the DLQ name for a queue or topic.
pub fn dlq_name(source: &str) -> String {
    format!("{}{}", source, DLQ_SUFFIX)
}

/// Per-source FIFO dead letter queues.
#[derive(Debug, Default)]
pub struct DeadLetterQueues {
    queues: Mutex<HashMap<String, VecDeque<Message>>>,
}

impl DeadLetterQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Message>>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a message to the DLQ for `source`. Returns the DLQ name.
    pub fn push(&self, source: &str, message: Message) -> String {
        let name = dlq_name(source);
        self.lock().entry(name.clone()).or_default().push_back(message);
        name
    }

    /// Remove and return the oldest dead-lettered message for `source`.
    pub fn pop(&self, source: &str) -> Option<Message> {
        self.lock()
            .get_mut(&dlq_name(source))
            .and_then(VecDeque::pop_front)
    }

    pub fn size(&self, source: &str) -> usize {
        self.lock().get(&dlq_name(source)).map_or(0, VecDeque::len)
    }

    /// The most recent `limit` messages, oldest first, without removing them.
    pub fn messages(&self, source: &str, limit: usize) -> Vec<Message> {
        self.lock()
            .get(&dlq_name(source))
            .map(|queue| {
                let skip = queue.len().saturating_sub(limit);
                queue.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Names of every DLQ that has ever received a message, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

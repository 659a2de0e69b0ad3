use chrono::{DateTime, Utc};
use qpromise_types::PromiseId;
use std::sync::Mutex;

/// One step in an operation's lifetime on a [`HardenedResourceQueue`](crate::HardenedResourceQueue).
///
/// `Recovered` fires instead of `Rejected` when the operation itself failed
/// but its `on_error` handler returned a value that fulfilled — the
/// caller's outcome promise fulfills with that value, not rejects. Either
/// way the queue's tail still advances cleanly (the resilient-tail
/// guarantee): a failed or recovered operation never stalls the ones
/// queued behind it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationEvent {
    Submitted,
    Queued,
    Running,
    Fulfilled,
    Rejected,
    Recovered,
}

/// An append-only entry in a queue's operation log. Sequence is 0-indexed
/// and monotonically increasing per queue; timestamp is wall-clock for
/// diagnostics only, never used to order entries.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub operation_id: PromiseId,
    pub event: OperationEvent,
}

/// Thread-safe append-only log of everything a queue has done to its
/// operations, in submission order.
#[derive(Default)]
pub struct OperationLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, operation_id: PromiseId, event: OperationEvent) {
        let mut entries = self.entries.lock().expect("operation log lock poisoned");
        let sequence = entries.len() as u64;
        tracing::debug!(%operation_id, ?event, sequence, "operation log entry");
        entries.push(LogEntry {
            sequence,
            timestamp: Utc::now(),
            operation_id,
            event,
        });
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().expect("operation log lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("operation log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

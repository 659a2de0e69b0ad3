use crate::error::{CoreError, ErrorKind};
use crate::promise_id::PromiseId;
use std::collections::HashMap;
use std::sync::Mutex;

/// The two terminal settlement states a durable record can carry.
///
/// Mirrors the promise core's own `PromiseState`, but lives here (not in
/// `qpromise-core`) so a backing implementation can depend on
/// `qpromise-types` alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettlementState {
    Fulfilled,
    Rejected,
}

/// What gets flushed for a settled durable promise: its terminal state
/// plus an opaque identifier for the payload, not the payload itself.
///
/// The core never asks a backing to serialize arbitrary payload contents —
/// only the caller-supplied `payload_id` round-trips. This is the literal
/// reading of "state and payload identifier must be flushed"; backings
/// that want to recover the real value keep their own side table keyed by
/// `payload_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedRecord {
    pub state: SettlementState,
    pub payload_id: String,
}

/// Durability contract a promise or hardened queue can be bound to.
///
/// Implementations decide the on-disk (or in-memory) representation; the
/// core only requires that `persist` complete before reactions observe the
/// settlement (I5), and that `load` return whatever the most recent
/// `persist` wrote.
pub trait DurableBacking: Send + Sync {
    /// Flush a settlement. Must be synchronously durable on return: once
    /// this returns `Ok`, a crash must not lose the record.
    fn persist(&self, id: &PromiseId, record: PersistedRecord) -> Result<(), CoreError>;

    /// Look up the most recently persisted record for `id`, if any.
    fn load(&self, id: &PromiseId) -> Option<PersistedRecord>;
}

/// Reference [`DurableBacking`] used by tests and as a template for real
/// backings. Not persistent across process restarts by construction (it
/// is, after all, in memory) — it exists to exercise the contract, not to
/// satisfy it end to end.
#[derive(Default)]
pub struct InMemoryDurableBacking {
    records: Mutex<HashMap<PromiseId, PersistedRecord>>,
}

impl InMemoryDurableBacking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("durable backing lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DurableBacking for InMemoryDurableBacking {
    fn persist(&self, id: &PromiseId, record: PersistedRecord) -> Result<(), CoreError> {
        self.records
            .lock()
            .map_err(|_| CoreError::new(ErrorKind::DurabilityFailed, "backing lock poisoned"))?
            .insert(id.clone(), record);
        Ok(())
    }

    fn load(&self, id: &PromiseId) -> Option<PersistedRecord> {
        self.records
            .lock()
            .expect("durable backing lock poisoned")
            .get(id)
            .cloned()
    }
}

use crate::promise::Promise;
use qpromise_scheduler::Scheduler;
use qpromise_types::{CoreError, DurableBacking, Payload, PromiseId};
use std::sync::Arc;

/// An external settler for a promise: exposes exactly the power to resolve
/// or reject the associated `promise` from outside, nothing more. Dropping
/// a `Deferred` without settling it is legal — its promise simply stays
/// pending forever.
#[derive(Clone)]
pub struct Deferred {
    promise: Promise,
}

impl Deferred {
    pub fn promise(&self) -> Promise {
        self.promise.clone()
    }

    pub fn resolve(&self, value: Payload) -> Result<(), CoreError> {
        self.promise.resolve(value)
    }

    pub fn reject(&self, reason: Payload) -> Result<(), CoreError> {
        self.promise.reject(reason)
    }
}

/// `Q.defer()`: a fresh pending promise plus its resolver/rejecter pair.
pub fn defer(scheduler: Arc<Scheduler>) -> Deferred {
    Deferred {
        promise: Promise::new(scheduler),
    }
}

/// A durable variant of [`defer`]: the underlying promise is bound to
/// `backing` under `id`.
pub fn defer_durable(scheduler: Arc<Scheduler>, backing: Arc<dyn DurableBacking>, id: PromiseId) -> Deferred {
    Deferred {
        promise: Promise::new_durable(scheduler, backing, id),
    }
}

/// A promise pre-settled to `Fulfilled(value)`.
pub fn resolved(scheduler: Arc<Scheduler>, value: Payload) -> Promise {
    let p = Promise::new(scheduler);
    p.resolve(value).expect("non-durable promise cannot fail to settle");
    p
}

/// A promise pre-settled to `Rejected(reason)`.
pub fn rejected(scheduler: Arc<Scheduler>, reason: Payload) -> Promise {
    let p = Promise::new(scheduler);
    p.reject(reason).expect("non-durable promise cannot fail to settle");
    p
}

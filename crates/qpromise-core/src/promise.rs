use qpromise_scheduler::{Microtask, Scheduler};
use qpromise_types::{CoreError, DurableBacking, ErrorKind, Payload, PersistedRecord, PromiseId, SettlementState};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A handler registered via [`Promise::then`]: consumes the settlement
/// payload and produces the chained promise's fulfillment value (or, via
/// thenable adoption, signals rejection by returning a rejected promise
/// wrapped in a payload — see [`Promise::resolve`]).
pub type Handler = Box<dyn FnOnce(Payload) -> Payload + Send>;

/// Observable lifecycle state of a promise. Mirrors the internal `Phase`
/// but has no reaction/dispatch plumbing attached, safe to hand to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Pending,
    Fulfilled,
    Rejected,
}

impl Phase {
    fn to_settlement(self) -> SettlementState {
        match self {
            Phase::Fulfilled => SettlementState::Fulfilled,
            Phase::Rejected => SettlementState::Rejected,
            Phase::Pending => unreachable!("settle is only called with a terminal phase"),
        }
    }
}

impl From<Phase> for PromiseState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Pending => PromiseState::Pending,
            Phase::Fulfilled => PromiseState::Fulfilled,
            Phase::Rejected => PromiseState::Rejected,
        }
    }
}

/// A registered `then()` reaction. Carries both optional handlers rather
/// than being split across two separate queues: dispatch matches the one
/// relevant to the settled phase and discards the other, which is
/// equivalent to the two-queue model but avoids duplicating the handler
/// pair across two `Vec`s.
struct Reaction {
    on_fulfilled: Option<Handler>,
    on_rejected: Option<Handler>,
    chained: Option<Promise>,
}

struct State {
    phase: Phase,
    value: Option<Payload>,
    reactions: Vec<Reaction>,
}

impl State {
    fn pending() -> Self {
        Self {
            phase: Phase::Pending,
            value: None,
            reactions: Vec::new(),
        }
    }
}

struct Inner {
    id: PromiseId,
    scheduler: Arc<Scheduler>,
    durable: Option<Arc<dyn DurableBacking>>,
    child_seq: AtomicU32,
    state: Mutex<State>,
}

/// An asynchronous cell holding a lifecycle state and a settlement
/// payload. Cheap to clone — a `Promise` is a handle (`Arc`) onto shared
/// state; the promise itself is kept alive by the longest-lived holder
/// among its creator, upstream chains, and queued reactions.
#[derive(Clone)]
pub struct Promise(Arc<Inner>);

static ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

impl Promise {
    /// A new pending, non-durable promise.
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let seq = ROOT_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::from_parts(PromiseId::anonymous_root(seq), scheduler, None)
    }

    /// A new pending promise backed by `backing`, identified by `id`. Every
    /// settlement of this promise (and of anything chained from it) is
    /// flushed to `backing` before reactions are scheduled (I5).
    pub fn new_durable(scheduler: Arc<Scheduler>, backing: Arc<dyn DurableBacking>, id: PromiseId) -> Self {
        Self::from_parts(id, scheduler, Some(backing))
    }

    fn from_parts(id: PromiseId, scheduler: Arc<Scheduler>, durable: Option<Arc<dyn DurableBacking>>) -> Self {
        Self(Arc::new(Inner {
            id,
            scheduler,
            durable,
            child_seq: AtomicU32::new(0),
            state: Mutex::new(State::pending()),
        }))
    }

    /// A chained promise: same scheduler and durability backing as its
    /// parent, with an id one level deeper in the parent's Dewey path.
    fn child(&self) -> Promise {
        let seq = self.0.child_seq.fetch_add(1, Ordering::Relaxed);
        let id = self.0.id.child(seq).unwrap_or_else(|_| self.0.id.clone());
        Self::from_parts(id, Arc::clone(&self.0.scheduler), self.0.durable.clone())
    }

    pub fn id(&self) -> &PromiseId {
        &self.0.id
    }

    pub fn state(&self) -> PromiseState {
        self.0.state.lock().expect("promise lock poisoned").phase.into()
    }

    /// The settlement payload, if this promise has settled. `None` while
    /// pending.
    pub fn value(&self) -> Option<Payload> {
        self.0.state.lock().expect("promise lock poisoned").value.clone()
    }

    /// Fulfill or adopt `value`.
    ///
    /// If `value` downcasts to another `Promise`, this promise adopts its
    /// eventual state instead of settling immediately (thenable adoption,
    /// I3). Adopting the promise's own handle is rejected with
    /// `InvalidArgument` rather than deadlocking.
    ///
    /// No-op if this promise is already settled (I1). Returns `Err` only
    /// when this is a durable promise and the backing failed to persist
    /// the settlement — in that case the promise remains `Pending`.
    pub fn resolve(&self, value: Payload) -> Result<(), CoreError> {
        if let Some(inner_promise) = value.downcast_ref::<Promise>() {
            if Arc::ptr_eq(&self.0, &inner_promise.0) {
                return self.settle(
                    Phase::Rejected,
                    Payload::new(CoreError::new(
                        ErrorKind::InvalidArgument,
                        "promise resolved with itself",
                    )),
                );
            }
            let inner_promise = inner_promise.clone();
            let resolver = self.clone();
            let rejecter = self.clone();
            inner_promise.subscribe(Reaction {
                on_fulfilled: Some(Box::new(move |v| {
                    let _ = resolver.resolve(v);
                    Payload::unit()
                })),
                on_rejected: Some(Box::new(move |r| {
                    let _ = rejecter.reject(r);
                    Payload::unit()
                })),
                chained: None,
            });
            Ok(())
        } else {
            self.settle(Phase::Fulfilled, value)
        }
    }

    /// Reject with `reason`. No-op if already settled (I1).
    pub fn reject(&self, reason: Payload) -> Result<(), CoreError> {
        self.settle(Phase::Rejected, reason)
    }

    fn settle(&self, phase: Phase, value: Payload) -> Result<(), CoreError> {
        let reactions = {
            let mut state = self.0.state.lock().expect("promise lock poisoned");
            if !matches!(state.phase, Phase::Pending) {
                return Ok(());
            }
            if let Some(backing) = &self.0.durable {
                let record = PersistedRecord {
                    state: phase.to_settlement(),
                    payload_id: value.identity(),
                };
                if let Err(err) = backing.persist(&self.0.id, record) {
                    tracing::error!(id = %self.0.id, error = %err, "failed to persist settlement; promise stays pending");
                    return Err(CoreError::new(
                        ErrorKind::DurabilityFailed,
                        "failed to persist promise settlement",
                    )
                    .with_detail(err.message));
                }
            }
            state.phase = phase;
            state.value = Some(value.clone());
            std::mem::take(&mut state.reactions)
        };
        tracing::debug!(id = %self.0.id, ?phase, "promise settled");
        for reaction in reactions {
            self.dispatch(phase, value.clone(), reaction);
        }
        Ok(())
    }

    /// Register fulfillment/rejection handlers. Always returns a new
    /// chained promise; if neither handler matches the eventual outcome,
    /// the parent's settlement propagates to it verbatim (I3).
    ///
    /// Dispatch against an already-settled parent still goes through the
    /// scheduler rather than running inline, so callers can always reason
    /// about handlers as asynchronous.
    pub fn then(&self, on_fulfilled: Option<Handler>, on_rejected: Option<Handler>) -> Promise {
        let chained = self.child();
        self.subscribe(Reaction {
            on_fulfilled,
            on_rejected,
            chained: Some(chained.clone()),
        });
        chained
    }

    fn subscribe(&self, reaction: Reaction) {
        let (phase, value) = {
            let mut state = self.0.state.lock().expect("promise lock poisoned");
            match state.phase {
                Phase::Pending => {
                    state.reactions.push(reaction);
                    return;
                }
                phase => (
                    phase,
                    state
                        .value
                        .clone()
                        .expect("terminal promise must carry a settlement value"),
                ),
            }
        };
        self.dispatch(phase, value, reaction);
    }

    fn dispatch(&self, phase: Phase, value: Payload, reaction: Reaction) {
        let scheduler = Arc::clone(&self.0.scheduler);
        scheduler.submit(Microtask::new(move || run_reaction(phase, value, reaction)));
    }
}

fn run_reaction(phase: Phase, value: Payload, reaction: Reaction) {
    let Reaction {
        on_fulfilled,
        on_rejected,
        chained,
    } = reaction;
    let handler = match phase {
        Phase::Fulfilled => on_fulfilled,
        Phase::Rejected => on_rejected,
        Phase::Pending => unreachable!("dispatch only runs for a terminal phase"),
    };
    match handler {
        Some(handler) => {
            let result = handler(value);
            if let Some(chained) = chained {
                let _ = chained.resolve(result);
            }
        }
        None => {
            if let Some(chained) = chained {
                let _ = match phase {
                    Phase::Fulfilled => chained.resolve(value),
                    Phase::Rejected => chained.reject(value),
                    Phase::Pending => unreachable!("dispatch only runs for a terminal phase"),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qpromise_types::InMemoryDurableBacking;
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::Duration;

    fn scheduler() -> Arc<Scheduler> {
        Scheduler::new()
    }

    fn wait_until<F: Fn() -> bool>(f: F) {
        for _ in 0..200 {
            if f() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(f(), "condition never became true");
    }

    #[test]
    fn straight_chain_fulfills_with_transformed_value() {
        let sched = scheduler();
        let p = Promise::new(Arc::clone(&sched));
        p.resolve(Payload::new("x".to_string())).unwrap();
        let q = p.then(
            Some(Box::new(|v: Payload| {
                let s = v.downcast_ref::<String>().unwrap().clone();
                Payload::new(format!("{s}!"))
            })),
            None,
        );
        sched.drain();
        wait_until(|| q.state() != PromiseState::Pending);
        assert_eq!(q.state(), PromiseState::Fulfilled);
        assert_eq!(q.value().unwrap().downcast_ref::<String>().unwrap(), "x!");
    }

    #[test]
    fn rejection_falls_through_until_a_rejection_handler_recovers() {
        let sched = scheduler();
        let p = Promise::new(Arc::clone(&sched));
        p.reject(Payload::new("err".to_string())).unwrap();
        let q = p.then(Some(Box::new(|v| v)), None);
        let r = q.then(
            None,
            Some(Box::new(|_reason: Payload| Payload::new("recovered".to_string()))),
        );
        sched.drain();
        wait_until(|| r.state() != PromiseState::Pending);
        assert_eq!(q.state(), PromiseState::Rejected);
        assert_eq!(q.value().unwrap().downcast_ref::<String>().unwrap(), "err");
        assert_eq!(r.state(), PromiseState::Fulfilled);
        assert_eq!(r.value().unwrap().downcast_ref::<String>().unwrap(), "recovered");
    }

    #[test]
    fn then_on_already_settled_parent_still_dispatches_asynchronously() {
        let sched = scheduler();
        let p = Promise::new(Arc::clone(&sched));
        p.resolve(Payload::new(1i32)).unwrap();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        let _q = p.then(
            Some(Box::new(move |v| {
                log2.lock().unwrap().push("handler ran");
                v
            })),
            None,
        );
        // Nothing has run yet: dispatch always goes through the scheduler.
        assert!(log.lock().unwrap().is_empty());
        sched.drain();
        wait_until(|| !log.lock().unwrap().is_empty());
    }

    #[test]
    fn resolving_with_a_promise_adopts_its_eventual_state() {
        let sched = scheduler();
        let outer = Promise::new(Arc::clone(&sched));
        let inner = Promise::new(Arc::clone(&sched));
        outer.resolve(Payload::new(inner.clone())).unwrap();
        inner.resolve(Payload::new(7i32)).unwrap();
        sched.drain();
        wait_until(|| outer.state() != PromiseState::Pending);
        assert_eq!(outer.state(), PromiseState::Fulfilled);
        assert_eq!(*outer.value().unwrap().downcast_ref::<i32>().unwrap(), 7);
    }

    #[test]
    fn resolving_a_promise_with_itself_is_rejected_as_a_cycle() {
        let sched = scheduler();
        let p = Promise::new(Arc::clone(&sched));
        let self_payload = Payload::new(p.clone());
        p.resolve(self_payload).unwrap();
        assert_eq!(p.state(), PromiseState::Rejected);
        let err = p.value().unwrap();
        let core_err = err.downcast_ref::<CoreError>().unwrap();
        assert_eq!(core_err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn resolve_after_settlement_is_a_silent_no_op() {
        let sched = scheduler();
        let p = Promise::new(Arc::clone(&sched));
        p.resolve(Payload::new(1i32)).unwrap();
        p.resolve(Payload::new(2i32)).unwrap();
        assert_eq!(*p.value().unwrap().downcast_ref::<i32>().unwrap(), 1);
    }

    #[test]
    fn durable_promise_persists_before_dispatch_and_stays_pending_on_failure() {
        struct FailingBacking;
        impl DurableBacking for FailingBacking {
            fn persist(
                &self,
                _id: &PromiseId,
                _record: PersistedRecord,
            ) -> Result<(), CoreError> {
                Err(CoreError::new(ErrorKind::DurabilityFailed, "disk full"))
            }
            fn load(&self, _id: &PromiseId) -> Option<PersistedRecord> {
                None
            }
        }

        let sched = scheduler();
        let backing: Arc<dyn DurableBacking> = Arc::new(FailingBacking);
        let id = PromiseId::root_for("test", "durable-fail");
        let p = Promise::new_durable(Arc::clone(&sched), backing, id);
        let err = p.resolve(Payload::new(1i32)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DurabilityFailed);
        assert_eq!(p.state(), PromiseState::Pending);

        let backing = Arc::new(InMemoryDurableBacking::new());
        let id = PromiseId::root_for("test", "durable-ok");
        let p = Promise::new_durable(sched, backing.clone(), id.clone());
        p.resolve(Payload::new(5i32)).unwrap();
        let record = backing.load(&id).unwrap();
        assert_eq!(record.state, SettlementState::Fulfilled);
    }
}

use crate::operation_log::{OperationEvent, OperationLog};
use qpromise_core::{defer, defer_durable, race, rejected, resolved, Promise};
use qpromise_scheduler::Scheduler;
use qpromise_types::{CoreError, DurableBacking, ErrorKind, Payload, PromiseId};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A submitted unit of work: receives the previous tail's value (usually
/// ignored) and returns a promise for its own, possibly asynchronous,
/// outcome. Any context the work needs belongs in the closure's capture
/// list, not threaded through as a parameter — the original design needed
/// an explicit `void* user_data` because C has no closures; a Rust
/// `FnOnce` already owns whatever it captured.
pub type Operation = Box<dyn FnOnce(Payload) -> Promise + Send>;

/// A per-submission recovery hook: receives the operation's rejection
/// reason. If the promise it returns fulfills, the submission is recorded
/// as `Recovered` and the caller's outcome promise fulfills with that
/// value; if it rejects, the submission is `Rejected` and the caller's
/// outcome promise rejects with the final reason.
pub type ErrorHandler = Box<dyn FnOnce(Payload) -> Promise + Send>;

/// Monotonic counters describing a queue's lifetime activity. `pending` is
/// submitted-but-not-yet-finalized operations (queued or running);
/// `completed`/`failed` only grow, even past a `free`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
}

struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    pending: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            pending: AtomicU64::new(0),
        }
    }
}

/// A resource-scoped serialization point: every operation submitted
/// against the same queue runs strictly after the one before it, on the
/// promise core's ordinary scheduler, without blocking a worker thread
/// while waiting on a slow operation.
///
/// Built by chaining a private "tail" promise through each submission,
/// rather than holding a lock across operations. The tail always settles
/// to fulfilled, whatever the operation it guards did — a failing
/// operation still rejects its own outcome promise, but never stalls the
/// ones queued behind it.
pub struct HardenedResourceQueue {
    resource_id: String,
    scheduler: Arc<Scheduler>,
    durable: Option<Arc<dyn DurableBacking>>,
    root_id: PromiseId,
    tail: Mutex<Promise>,
    next_operation_seq: AtomicU32,
    log: Arc<OperationLog>,
    counters: Arc<Counters>,
    shutting_down: AtomicBool,
}

impl HardenedResourceQueue {
    /// A new queue for `resource_id`, with its tail pre-resolved so the
    /// first submission runs as soon as the scheduler gets to it.
    pub fn new(resource_id: impl Into<String>, scheduler: Arc<Scheduler>) -> Arc<Self> {
        Self::build(resource_id, scheduler, None)
    }

    /// A queue whose per-operation outcome promises (not the internal
    /// tail) are durable, flushed to `backing` under ids rooted at the
    /// queue's own resource-scoped root.
    ///
    /// The root id is derived deterministically from `resource_id`, so the
    /// queue's identity survives a restart on its own; the operation
    /// counter is recovered by probing `backing` for the longest run of
    /// already-persisted `root.child(0)`, `root.child(1)`, ... records, so
    /// the next submission after a restart picks up where the last run
    /// left off instead of reissuing (and colliding with) old ids.
    pub fn new_durable(resource_id: impl Into<String>, scheduler: Arc<Scheduler>, backing: Arc<dyn DurableBacking>) -> Arc<Self> {
        Self::build(resource_id, scheduler, Some(backing))
    }

    fn build(resource_id: impl Into<String>, scheduler: Arc<Scheduler>, durable: Option<Arc<dyn DurableBacking>>) -> Arc<Self> {
        let resource_id = resource_id.into();
        let root_id = PromiseId::root_for("hardened-queue", &resource_id);
        let tail = resolved(Arc::clone(&scheduler), Payload::unit());
        let recovered_seq = match &durable {
            Some(backing) => recover_operation_seq(backing.as_ref(), &root_id),
            None => 0,
        };
        Arc::new(Self {
            resource_id,
            scheduler,
            durable,
            root_id,
            tail: Mutex::new(tail),
            next_operation_seq: AtomicU32::new(recovered_seq),
            log: Arc::new(OperationLog::new()),
            counters: Arc::new(Counters::new()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            pending: self.counters.pending.load(Ordering::Relaxed),
        }
    }

    /// Queues `operation` to run once every earlier submission against this
    /// resource has finished, with an optional `on_error` recovery hook.
    /// The queue does not invoke either until its turn arrives.
    ///
    /// Returns a promise that settles with this submission's own outcome —
    /// `operation`'s result, or `on_error`'s result if `operation` rejected
    /// and a handler was given. A rejection here never prevents later
    /// submissions from running (the resilient tail, see `DESIGN.md`).
    ///
    /// Rejects immediately with `QueueShuttingDown` if `free` has already
    /// been called on this queue.
    pub fn submit(self: &Arc<Self>, operation: Operation, on_error: Option<ErrorHandler>) -> Promise {
        if self.shutting_down.load(Ordering::SeqCst) {
            return rejected(
                Arc::clone(&self.scheduler),
                Payload::new(CoreError::new(ErrorKind::QueueShuttingDown, "queue is being freed")),
            );
        }
        self.submit_raw(operation, on_error)
    }

    fn submit_raw(self: &Arc<Self>, operation: Operation, on_error: Option<ErrorHandler>) -> Promise {
        let seq = self.next_operation_seq.fetch_add(1, Ordering::Relaxed);
        let operation_id = self.root_id.child(seq).unwrap_or_else(|_| self.root_id.clone());

        let outcome = match &self.durable {
            Some(backing) => defer_durable(Arc::clone(&self.scheduler), Arc::clone(backing), operation_id.clone()),
            None => defer(Arc::clone(&self.scheduler)),
        };
        let outcome_promise = outcome.promise();
        let next_tail = defer(Arc::clone(&self.scheduler));
        let next_tail_promise = next_tail.promise();

        self.counters.pending.fetch_add(1, Ordering::Relaxed);
        self.log.record(operation_id.clone(), OperationEvent::Submitted);

        let resource_id = self.resource_id.clone();
        let log = Arc::clone(&self.log);
        let counters = Arc::clone(&self.counters);

        self.log.record(operation_id.clone(), OperationEvent::Queued);

        let mut tail_guard = self.tail.lock().expect("queue tail lock poisoned");
        let old_tail = tail_guard.clone();

        old_tail.then(
            Some(Box::new(move |prev: Payload| {
                log.record(operation_id.clone(), OperationEvent::Running);
                tracing::debug!(resource_id = %resource_id, %operation_id, "running hardened operation");

                let work = operation(prev);

                let outcome_ok = outcome.clone();
                let tail_ok = next_tail.clone();
                let log_ok = Arc::clone(&log);
                let id_ok = operation_id.clone();
                let counters_ok = Arc::clone(&counters);

                let outcome_err = outcome.clone();
                let tail_err = next_tail.clone();
                let log_err = Arc::clone(&log);
                let id_err = operation_id.clone();
                let counters_err = Arc::clone(&counters);

                work.then(
                    Some(Box::new(move |value: Payload| {
                        log_ok.record(id_ok.clone(), OperationEvent::Fulfilled);
                        counters_ok.completed.fetch_add(1, Ordering::Relaxed);
                        counters_ok.pending.fetch_sub(1, Ordering::Relaxed);
                        let _ = outcome_ok.resolve(value);
                        let _ = tail_ok.resolve(Payload::unit());
                        Payload::unit()
                    })),
                    Some(Box::new(move |reason: Payload| {
                        match on_error {
                            Some(handler) => {
                                let recovery = handler(reason);
                                let log_recover = Arc::clone(&log_err);
                                let log_fail = Arc::clone(&log_err);
                                let id_recover = id_err.clone();
                                let id_fail = id_err.clone();
                                let tail_recover = tail_err.clone();
                                let tail_fail = tail_err.clone();
                                let outcome_recover = outcome_err.clone();
                                let outcome_fail = outcome_err.clone();
                                let counters_recover = Arc::clone(&counters_err);
                                let counters_fail = Arc::clone(&counters_err);
                                recovery.then(
                                    Some(Box::new(move |recovered: Payload| {
                                        log_recover.record(id_recover.clone(), OperationEvent::Recovered);
                                        counters_recover.completed.fetch_add(1, Ordering::Relaxed);
                                        counters_recover.pending.fetch_sub(1, Ordering::Relaxed);
                                        let _ = outcome_recover.resolve(recovered);
                                        let _ = tail_recover.resolve(Payload::unit());
                                        Payload::unit()
                                    })),
                                    Some(Box::new(move |final_reason: Payload| {
                                        log_fail.record(id_fail.clone(), OperationEvent::Rejected);
                                        counters_fail.failed.fetch_add(1, Ordering::Relaxed);
                                        counters_fail.pending.fetch_sub(1, Ordering::Relaxed);
                                        let _ = outcome_fail.reject(final_reason);
                                        let _ = tail_fail.resolve(Payload::unit());
                                        Payload::unit()
                                    })),
                                );
                            }
                            None => {
                                log_err.record(id_err.clone(), OperationEvent::Rejected);
                                counters_err.failed.fetch_add(1, Ordering::Relaxed);
                                counters_err.pending.fetch_sub(1, Ordering::Relaxed);
                                let _ = outcome_err.reject(reason);
                                let _ = tail_err.resolve(Payload::unit());
                            }
                        }
                        Payload::unit()
                    })),
                );

                Payload::unit()
            })),
            None,
        );

        *tail_guard = next_tail_promise;
        drop(tail_guard);

        outcome_promise
    }

    /// Resolves once every operation submitted before this call has
    /// finished, or rejects if `timeout` elapses first. The "every
    /// operation finished" side is a no-op operation submitted through the
    /// normal path (bypassing the `free` gate, since `free` itself drives a
    /// flush after shutting the queue down), so it waits behind everything
    /// already queued without needing separate bookkeeping; it races
    /// against a timer promise.
    pub fn flush(self: &Arc<Self>, timeout: Duration) -> Promise {
        let scheduler_for_op = Arc::clone(&self.scheduler);
        let drained = self.submit_raw(Box::new(move |_prev| resolved(scheduler_for_op, Payload::unit())), None);
        let timer = timeout_after(Arc::clone(&self.scheduler), timeout);
        race(Arc::clone(&self.scheduler), vec![drained, timer])
    }

    /// Marks the queue as shutting down — every `submit` from this point on
    /// rejects immediately with `QueueShuttingDown` — then waits (bounded by
    /// `timeout`) for outstanding operations to finish. There is no
    /// separately-allocated native resource to release beyond that; dropping
    /// the last `Arc<HardenedResourceQueue>` handle is enough for the rest.
    pub fn free(self: &Arc<Self>, timeout: Duration) -> Promise {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.flush(timeout)
    }
}

/// Probes `backing` for the longest run of already-persisted
/// `root.child(0)`, `root.child(1)`, ... records, so a durable queue
/// reconstructed against the same backing after a restart resumes
/// numbering where the previous run left off rather than reissuing (and
/// overwriting) ids already on record.
fn recover_operation_seq(backing: &dyn DurableBacking, root_id: &PromiseId) -> u32 {
    let mut seq: u32 = 0;
    loop {
        match root_id.child(seq) {
            Ok(id) if backing.load(&id).is_some() => seq += 1,
            _ => break,
        }
    }
    seq
}

/// A promise that rejects once `timeout` has elapsed, on a dedicated
/// thread — used to bound `HardenedResourceQueue::flush`.
fn timeout_after(scheduler: Arc<Scheduler>, timeout: Duration) -> Promise {
    let deferred = defer(scheduler);
    let waiter = deferred.clone();
    std::thread::spawn(move || {
        std::thread::sleep(timeout);
        let _ = waiter.reject(Payload::new("flush timed out".to_string()));
    });
    deferred.promise()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

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
    fn operations_run_in_submission_order() {
        let sched = Scheduler::new();
        let queue = HardenedResourceQueue::new("res-a", Arc::clone(&sched));
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = Arc::clone(&order);
            let sched2 = Arc::clone(&sched);
            queue.submit(
                Box::new(move |_prev| {
                    order.lock().unwrap().push(i);
                    resolved(sched2, Payload::new(i))
                }),
                None,
            );
        }

        wait_until(|| order.lock().unwrap().len() == 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn a_rejected_operation_does_not_stall_later_submissions() {
        let sched = Scheduler::new();
        let queue = HardenedResourceQueue::new("res-b", Arc::clone(&sched));
        let ran_second = Arc::new(AtomicBool::new(false));

        let sched2 = Arc::clone(&sched);
        let first = queue.submit(
            Box::new(move |_prev| {
                let d = qpromise_core::defer(sched2);
                let _ = d.reject(Payload::new("first failed".to_string()));
                d.promise()
            }),
            None,
        );

        let flag = Arc::clone(&ran_second);
        let sched3 = Arc::clone(&sched);
        let second = queue.submit(
            Box::new(move |_prev| {
                flag.store(true, Ordering::SeqCst);
                resolved(sched3, Payload::new("second ok".to_string()))
            }),
            None,
        );

        wait_until(|| ran_second.load(Ordering::SeqCst));
        wait_until(|| first.state() != qpromise_core::PromiseState::Pending);
        wait_until(|| second.state() != qpromise_core::PromiseState::Pending);

        assert_eq!(first.state(), qpromise_core::PromiseState::Rejected);
        assert_eq!(second.state(), qpromise_core::PromiseState::Fulfilled);
    }

    #[test]
    fn an_error_handler_that_recovers_fulfills_the_outcome() {
        let sched = Scheduler::new();
        let queue = HardenedResourceQueue::new("res-c", Arc::clone(&sched));

        let sched2 = Arc::clone(&sched);
        let sched3 = Arc::clone(&sched);
        let outcome = queue.submit(
            Box::new(move |_prev| {
                let d = qpromise_core::defer(sched2);
                let _ = d.reject(Payload::new("boom".to_string()));
                d.promise()
            }),
            Some(Box::new(move |_reason| resolved(sched3, Payload::new("fallback".to_string())))),
        );

        wait_until(|| outcome.state() != qpromise_core::PromiseState::Pending);
        assert_eq!(outcome.state(), qpromise_core::PromiseState::Fulfilled);
        assert_eq!(
            outcome.value().unwrap().downcast_ref::<String>().unwrap(),
            "fallback"
        );

        let events: Vec<OperationEvent> = queue.log().entries().into_iter().map(|e| e.event).collect();
        assert!(events.contains(&OperationEvent::Recovered));
        assert!(!events.contains(&OperationEvent::Rejected));

        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn submission_log_records_the_full_lifecycle() {
        let sched = Scheduler::new();
        let queue = HardenedResourceQueue::new("res-d", Arc::clone(&sched));
        let sched2 = Arc::clone(&sched);
        let outcome = queue.submit(Box::new(move |_prev| resolved(sched2, Payload::new(7i32))), None);
        wait_until(|| outcome.state() != qpromise_core::PromiseState::Pending);

        let events: Vec<OperationEvent> = queue.log().entries().into_iter().map(|e| e.event).collect();
        assert_eq!(
            events,
            vec![
                OperationEvent::Submitted,
                OperationEvent::Queued,
                OperationEvent::Running,
                OperationEvent::Fulfilled
            ]
        );
    }

    #[test]
    fn flush_resolves_once_everything_submitted_so_far_has_finished() {
        let sched = Scheduler::new();
        let queue = HardenedResourceQueue::new("res-e", Arc::clone(&sched));
        let sched2 = Arc::clone(&sched);
        queue.submit(
            Box::new(move |_prev| {
                thread::sleep(Duration::from_millis(20));
                resolved(sched2, Payload::unit())
            }),
            None,
        );

        let flushed = queue.flush(Duration::from_secs(1));
        wait_until(|| flushed.state() != qpromise_core::PromiseState::Pending);
        assert_eq!(flushed.state(), qpromise_core::PromiseState::Fulfilled);
    }

    #[test]
    fn stats_track_completed_failed_and_pending_across_several_submissions() {
        let sched = Scheduler::new();
        let queue = HardenedResourceQueue::new("res-f", Arc::clone(&sched));

        let sched_ok = Arc::clone(&sched);
        let ok = queue.submit(Box::new(move |_prev| resolved(sched_ok, Payload::unit())), None);
        let sched_err = Arc::clone(&sched);
        let err = queue.submit(
            Box::new(move |_prev| {
                let d = qpromise_core::defer(sched_err);
                let _ = d.reject(Payload::new("nope".to_string()));
                d.promise()
            }),
            None,
        );

        wait_until(|| ok.state() != qpromise_core::PromiseState::Pending);
        wait_until(|| err.state() != qpromise_core::PromiseState::Pending);

        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn submit_after_free_rejects_with_queue_shutting_down() {
        let sched = Scheduler::new();
        let queue = HardenedResourceQueue::new("res-g", Arc::clone(&sched));

        let freed = queue.free(Duration::from_secs(1));
        wait_until(|| freed.state() != qpromise_core::PromiseState::Pending);

        let sched2 = Arc::clone(&sched);
        let rejected_submit = queue.submit(Box::new(move |_prev| resolved(sched2, Payload::unit())), None);
        wait_until(|| rejected_submit.state() != qpromise_core::PromiseState::Pending);
        assert_eq!(rejected_submit.state(), qpromise_core::PromiseState::Rejected);
        let err = rejected_submit.value().unwrap();
        let err = err.downcast_ref::<CoreError>().unwrap();
        assert_eq!(err.kind, ErrorKind::QueueShuttingDown);
    }

    #[test]
    fn a_durable_queue_recovers_its_operation_count_across_restart() {
        use qpromise_types::InMemoryDurableBacking;

        let sched = Scheduler::new();
        let backing: Arc<dyn DurableBacking> = Arc::new(InMemoryDurableBacking::new());

        let first_run = HardenedResourceQueue::new_durable("res-h", Arc::clone(&sched), Arc::clone(&backing));
        for _ in 0..3 {
            let sched_op = Arc::clone(&sched);
            let outcome = first_run.submit(Box::new(move |_prev| resolved(sched_op, Payload::unit())), None);
            wait_until(|| outcome.state() != qpromise_core::PromiseState::Pending);
        }
        drop(first_run);

        let restarted = HardenedResourceQueue::new_durable("res-h", Arc::clone(&sched), Arc::clone(&backing));
        let sched_op = Arc::clone(&sched);
        let outcome = restarted.submit(Box::new(move |_prev| resolved(sched_op, Payload::new(99i32))), None);
        wait_until(|| outcome.state() != qpromise_core::PromiseState::Pending);

        let events: Vec<OperationEvent> = restarted.log().entries().into_iter().map(|e| e.event).collect();
        assert_eq!(events.first(), Some(&OperationEvent::Submitted));
        // The fourth durable operation id picks up at child(3), not a reused
        // child(0) that would collide with the first run's first record.
        let fourth_id = restarted.root_id.child(3).unwrap();
        assert!(backing.load(&fourth_id).is_some());
    }
}

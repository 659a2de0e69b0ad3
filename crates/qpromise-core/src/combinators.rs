use crate::deferred::{defer, Deferred};
use crate::promise::Promise;
use qpromise_scheduler::Scheduler;
use qpromise_types::Payload;
use std::sync::{Arc, Mutex};

/// Per-input outcome recorded by [`all_settled`].
#[derive(Clone, Debug)]
pub enum Settled {
    Fulfilled(Payload),
    Rejected(Payload),
}

impl Settled {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settled::Fulfilled(_))
    }
}

/// `Q.all()`: fulfills with every input's value, in input order, once all
/// have fulfilled; rejects with the first input to reject and ignores
/// later settlements of the others (P4).
pub fn all(scheduler: Arc<Scheduler>, promises: Vec<Promise>) -> Promise {
    if promises.is_empty() {
        let d = defer(scheduler);
        d.resolve(Payload::new(Vec::<Payload>::new()))
            .expect("non-durable promise cannot fail to settle");
        return d.promise();
    }

    struct Context {
        results: Vec<Option<Payload>>,
        fulfilled: usize,
        rejected: bool,
    }

    let count = promises.len();
    let context = Arc::new(Mutex::new(Context {
        results: vec![None; count],
        fulfilled: 0,
        rejected: false,
    }));
    let deferred = defer(scheduler);

    for (index, promise) in promises.into_iter().enumerate() {
        let context = Arc::clone(&context);
        let deferred_ok = deferred.clone();
        let deferred_err = deferred.clone();
        promise.then(
            Some(Box::new(move |value: Payload| {
                let mut ctx = context.lock().expect("Q.all context lock poisoned");
                if ctx.rejected {
                    return Payload::unit();
                }
                ctx.results[index] = Some(value);
                ctx.fulfilled += 1;
                if ctx.fulfilled == count {
                    let results: Vec<Payload> = ctx
                        .results
                        .iter()
                        .cloned()
                        .map(|v| v.expect("every slot filled once fulfilled reaches count"))
                        .collect();
                    drop(ctx);
                    let _ = deferred_ok.resolve(Payload::new(results));
                }
                Payload::unit()
            })),
            Some(Box::new(move |reason: Payload| {
                let mut ctx = context.lock().expect("Q.all context lock poisoned");
                if !ctx.rejected {
                    ctx.rejected = true;
                    drop(ctx);
                    let _ = deferred_err.reject(reason);
                }
                Payload::unit()
            })),
        );
    }

    deferred.promise()
}

/// `Q.allSettled()`: fulfills once every input has settled, with one
/// [`Settled`] record per input in input order. Never rejects.
pub fn all_settled(scheduler: Arc<Scheduler>, promises: Vec<Promise>) -> Promise {
    if promises.is_empty() {
        let d = defer(scheduler);
        d.resolve(Payload::new(Vec::<Settled>::new()))
            .expect("non-durable promise cannot fail to settle");
        return d.promise();
    }

    struct Context {
        results: Vec<Option<Settled>>,
        settled: usize,
    }

    let count = promises.len();
    let context = Arc::new(Mutex::new(Context {
        results: vec![None; count],
        settled: 0,
    }));
    let deferred = defer(scheduler);

    fn record(context: &Arc<Mutex<Context>>, deferred: &Deferred, count: usize, index: usize, outcome: Settled) {
        let mut ctx = context.lock().expect("Q.allSettled context lock poisoned");
        ctx.results[index] = Some(outcome);
        ctx.settled += 1;
        if ctx.settled == count {
            let results: Vec<Settled> = ctx
                .results
                .iter()
                .cloned()
                .map(|v| v.expect("every slot filled once settled reaches count"))
                .collect();
            drop(ctx);
            let _ = deferred.resolve(Payload::new(results));
        }
    }

    for (index, promise) in promises.into_iter().enumerate() {
        let context_ok = Arc::clone(&context);
        let context_err = Arc::clone(&context);
        let deferred_ok = deferred.clone();
        let deferred_err = deferred.clone();
        promise.then(
            Some(Box::new(move |value: Payload| {
                record(&context_ok, &deferred_ok, count, index, Settled::Fulfilled(value));
                Payload::unit()
            })),
            Some(Box::new(move |reason: Payload| {
                record(&context_err, &deferred_err, count, index, Settled::Rejected(reason));
                Payload::unit()
            })),
        );
    }

    deferred.promise()
}

/// Settles with the first input to settle, in either direction. Not named
/// in the distilled combinator list but paired with `all`/`allSettled` in
/// most promise libraries and in the original event-loop design; included
/// here for completeness. An empty input list never settles, matching
/// `Promise.race([])` in other promise libraries.
pub fn race(scheduler: Arc<Scheduler>, promises: Vec<Promise>) -> Promise {
    let deferred = defer(scheduler);
    for promise in promises {
        let deferred_ok = deferred.clone();
        let deferred_err = deferred.clone();
        promise.then(
            Some(Box::new(move |value: Payload| {
                let _ = deferred_ok.resolve(value);
                Payload::unit()
            })),
            Some(Box::new(move |reason: Payload| {
                let _ = deferred_err.reject(reason);
                Payload::unit()
            })),
        );
    }
    deferred.promise()
}

/// Node-style trampoline: `(error, result) -> unit`. `starter` is handed the
/// trampoline it must eventually call with either an error or a result; any
/// context it needs belongs in its own closure capture rather than a
/// positional parameter.
pub type NodeCallback = Box<dyn FnOnce(Option<Payload>, Option<Payload>) + Send>;

/// `Q.nfcall()`-equivalent: wraps a function that eventually reports
/// `(error, result)` through a trampoline into a promise.
pub fn from_node_style<F>(scheduler: Arc<Scheduler>, starter: F) -> Promise
where
    F: FnOnce(NodeCallback) + Send + 'static,
{
    let deferred = defer(scheduler);
    let settle = deferred.clone();
    let trampoline: NodeCallback = Box::new(move |error, result| match error {
        Some(reason) => {
            let _ = settle.reject(reason);
        }
        None => {
            let _ = settle.resolve(result.unwrap_or_else(Payload::unit));
        }
    });
    starter(trampoline);
    deferred.promise()
}

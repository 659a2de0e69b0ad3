use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A unit of deferred work. Always either a promise reaction dispatch or a
/// node-style trampoline invocation in the layers above this crate; the
/// scheduler itself only knows it is a closure to run once.
pub struct Microtask {
    task: Box<dyn FnOnce() + Send + 'static>,
}

impl Microtask {
    pub fn new<F: FnOnce() + Send + 'static>(task: F) -> Self {
        Self {
            task: Box::new(task),
        }
    }

    fn run(self) {
        self.task();
    }
}

struct Queue {
    items: Mutex<VecDeque<Microtask>>,
    condition: Condvar,
    should_exit: Mutex<bool>,
}

impl Queue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            condition: Condvar::new(),
            should_exit: Mutex::new(false),
        }
    }

    fn push(&self, task: Microtask) {
        let mut items = self.items.lock().expect("scheduler queue lock poisoned");
        items.push_back(task);
        self.condition.notify_one();
    }

    fn pop(&self) -> Option<Microtask> {
        self.items
            .lock()
            .expect("scheduler queue lock poisoned")
            .pop_front()
    }

    fn pending(&self) -> usize {
        self.items.lock().expect("scheduler queue lock poisoned").len()
    }

    fn signal_exit(&self) {
        *self.should_exit.lock().expect("scheduler exit lock poisoned") = true;
        self.condition.notify_all();
    }

    fn exiting(&self) -> bool {
        *self.should_exit.lock().expect("scheduler exit lock poisoned")
    }

    /// Block the calling worker until either a task is pushed or exit is
    /// signalled, bounded by a short timeout so the exit flag is rechecked
    /// even without a spurious wakeup (mirrors the original's 1ms
    /// `pthread_cond_timedwait` poll).
    fn wait_for_work(&self) {
        let guard = self.items.lock().expect("scheduler queue lock poisoned");
        if !guard.is_empty() || self.exiting() {
            return;
        }
        let _ = self
            .condition
            .wait_timeout(guard, Duration::from_millis(1))
            .expect("scheduler queue lock poisoned");
    }
}

/// Tunable worker-pool shape. Builder-style, mirroring the config structs
/// used elsewhere in this workspace: construct with `SchedulerConfig::default()`,
/// chain setters, then hand to [`Scheduler::with_config`].
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    worker_count: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .clamp(1, 4),
        }
    }
}

impl SchedulerConfig {
    pub fn worker_count(mut self, n: usize) -> Self {
        self.worker_count = n.max(1);
        self
    }
}

/// Running counters surfaced for diagnostics: total tasks executed, total
/// idle/poll iterations across all workers, and current queue depth.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub tasks_executed: u64,
    pub total_iterations: u64,
    pub pending_tasks: u64,
}

struct Counters {
    tasks_executed: AtomicU64,
    total_iterations: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            tasks_executed: AtomicU64::new(0),
            total_iterations: AtomicU64::new(0),
        }
    }
}

/// A FIFO microtask scheduler backed by a worker thread pool.
///
/// Submission is lock-free from the caller's perspective beyond a short
/// critical section; dispatch runs on worker threads so `submit` never
/// blocks waiting for a task to execute. A task that panics is caught at
/// the dispatch boundary and logged — it does not poison the queue or
/// stop sibling workers, but the promise (if any) that task was meant to
/// settle simply never settles from that path.
pub struct Scheduler {
    queue: Arc<Queue>,
    counters: Arc<Counters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    start_time: Instant,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            queue: Arc::new(Queue::new()),
            counters: Arc::new(Counters::new()),
            workers: Mutex::new(Vec::new()),
            start_time: Instant::now(),
        });
        scheduler.start(config.worker_count);
        scheduler
    }

    fn start(self: &Arc<Self>, worker_count: usize) {
        let mut workers = self.workers.lock().expect("scheduler workers lock poisoned");
        for idx in 0..worker_count {
            let queue = Arc::clone(&self.queue);
            let counters = Arc::clone(&self.counters);
            let handle = thread::Builder::new()
                .name(format!("qpromise-worker-{idx}"))
                .spawn(move || worker_loop(queue, counters))
                .expect("failed to spawn scheduler worker thread");
            workers.push(handle);
        }
    }

    /// Append a task to the tail of the queue. Wakes exactly one idle
    /// worker. Never blocks beyond the submission critical section.
    pub fn submit(&self, task: Microtask) {
        self.queue.push(task);
    }

    /// Pop one task and execute it on the calling thread, synchronously.
    /// Returns whether a task was actually run. Intended for synchronous
    /// bootstraps and tests; real dispatch happens on worker threads
    /// regardless of whether this is ever called.
    pub fn run_one(&self) -> bool {
        match self.queue.pop() {
            Some(task) => {
                execute_task(task, &self.counters);
                true
            }
            None => false,
        }
    }

    /// Run tasks synchronously on the calling thread until the queue is
    /// empty.
    pub fn drain(&self) {
        loop {
            let mut ran_any = false;
            while self.run_one() {
                ran_any = true;
            }
            if !ran_any {
                break;
            }
            thread::yield_now();
        }
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.pending()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            tasks_executed: self.counters.tasks_executed.load(Ordering::Relaxed),
            total_iterations: self.counters.total_iterations.load(Ordering::Relaxed),
            pending_tasks: self.queue.pending() as u64,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Signal all workers to stop and join them. Queued tasks at stop time
    /// are dropped without running; no task is ever partially executed.
    pub fn stop(&self) {
        self.queue.signal_exit();
        let mut workers = self.workers.lock().expect("scheduler workers lock poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(queue: Arc<Queue>, counters: Arc<Counters>) {
    loop {
        let mut had_work = false;
        while let Some(task) = queue.pop() {
            execute_task(task, &counters);
            had_work = true;
        }
        counters.total_iterations.fetch_add(1, Ordering::Relaxed);
        if queue.exiting() && queue.pending() == 0 {
            return;
        }
        if !had_work {
            queue.wait_for_work();
            if queue.exiting() && queue.pending() == 0 {
                return;
            }
        }
    }
}

fn execute_task(task: Microtask, counters: &Counters) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
        let message = panic_message(&panic);
        tracing::error!(%message, "microtask panicked; scheduler continues");
    }
    counters.tasks_executed.fetch_add(1, Ordering::Relaxed);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

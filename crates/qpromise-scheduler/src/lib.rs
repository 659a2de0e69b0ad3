mod scheduler;

pub use scheduler::{Microtask, Scheduler, SchedulerConfig, SchedulerStats};

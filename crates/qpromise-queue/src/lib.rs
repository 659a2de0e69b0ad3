mod operation_log;
mod queue;

pub use operation_log::{LogEntry, OperationEvent, OperationLog};
pub use queue::{ErrorHandler, HardenedResourceQueue, Operation, QueueStats};

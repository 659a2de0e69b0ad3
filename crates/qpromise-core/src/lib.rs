mod combinators;
mod deferred;
mod promise;

pub use combinators::{all, all_settled, from_node_style, race, NodeCallback, Settled};
pub use deferred::{defer, defer_durable, rejected, resolved, Deferred};
pub use promise::{Handler, Promise, PromiseState};

pub use qpromise_scheduler::{Microtask, Scheduler, SchedulerConfig, SchedulerStats};
pub use qpromise_types::{
    CoreError, DurableBacking, ErrorKind, InMemoryDurableBacking, Payload, PersistedRecord, PromiseId,
    SettlementState,
};

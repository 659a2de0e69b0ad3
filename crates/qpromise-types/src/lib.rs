pub mod durability;
pub mod error;
pub mod payload;
pub mod promise_id;

pub use durability::{DurableBacking, InMemoryDurableBacking, PersistedRecord, SettlementState};
pub use error::{CoreError, ErrorKind};
pub use payload::Payload;
pub use promise_id::{MAX_CALL_DEPTH, PromiseId};

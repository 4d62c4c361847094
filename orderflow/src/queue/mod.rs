//! Per-stage dispatch queues and the workers that drain them.

mod memory;
mod message;
mod worker;

pub use memory::{InMemoryStageQueue, StageQueue};
pub use message::{DispatchMessage, CHAIN_TO_NEXT};
pub use worker::{StageExecutor, Worker};

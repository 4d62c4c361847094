//! Stage execution: the body contract, the context a body runs in, and the
//! runner that wraps every body with idempotency and failure handling.

mod body;
mod context;
mod stage_runner;

pub use body::{FnStageBody, StageBody};
pub use context::{ProgressReporter, StageContext};
pub use stage_runner::{StageInvocation, StageOutcome, StageRunner};

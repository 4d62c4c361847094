//! Progress channel.
//!
//! One event fans out to:
//! - the order's mutable status record (best effort, rebuildable)
//! - the append-only stage log (source of truth)
//! - the order's live topic (best effort)

mod channel;
mod memory;
mod sinks;

pub use channel::{round_pct, ProgressChannel, PublishReport, SinkOutcome};
pub use memory::{BroadcastTopicBus, InMemoryLogStore, InMemoryOrderStore};
pub use sinks::{LogStore, OrderStore, ReleaseHook, Topic, TopicBus, TopicSubscription};

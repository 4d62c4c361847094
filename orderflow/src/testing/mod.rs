//! Reusable fakes for exercising the orchestrator without real services.
//!
//! This module provides:
//! - A scripted transport and an offline fetcher
//! - Sinks that always fail, and one that injects a racing cancel
//! - Stage bodies with recorded or scripted behavior

mod bodies;
mod sinks;
mod transport;

pub use bodies::{BlockingBody, CancellingBody, FailingBody, RecordingBody};
pub use sinks::{test_channel, CancelBeforeTransition, FailingLogStore, FailingOrderStore, FailingTopicBus};
pub use transport::{offline_fetcher, ScriptedTransport};

//! Core domain model types for orderflow.
//!
//! This module contains the fundamental types shared by every component:
//! - Order record and partial status updates
//! - Stage, order, and log status enums
//! - Progress events and immutable log entries
//! - Per-stage artifact manifests

mod event;
mod manifest;
mod order;
mod status;

pub use event::{NewLogEntry, ProgressEvent, StageLogEntry, FAILED_PCT};
pub use manifest::{ManifestSet, StageManifest};
pub use order::{Order, OrderId, StatusUpdate};
pub use status::{LogStatus, OrderStatus, StageName};

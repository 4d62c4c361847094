//! Cooperative cancellation for long-lived loops (gateway streams, workers).
//!
//! Order cancellation itself is a status write observed at stage
//! checkpoints; this token only stops in-process loops.

mod token;

pub use token::CancellationToken;

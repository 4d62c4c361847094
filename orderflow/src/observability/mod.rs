//! Observability utilities: subscriber setup, spans, and timers.

mod logging;
mod timer;

pub use logging::{init_tracing, order_span, LogFormat};
pub use timer::SpanTimer;

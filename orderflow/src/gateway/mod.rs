//! The streaming gateway: live per-order progress for long-lived clients.

mod frame;
mod stream;

pub use frame::GatewayFrame;
pub use stream::StreamingGateway;

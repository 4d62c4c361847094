//! Frames sent to a streaming client.

use std::fmt::Write as _;

/// One frame on a client's progress stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayFrame {
    /// The newest progress event, as its JSON payload.
    Progress(String),
    /// Keepalive sent while the order is idle.
    Ping,
}

impl GatewayFrame {
    /// The event name on the wire.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Progress(_) => "progress",
            Self::Ping => "ping",
        }
    }

    /// The frame body; empty for pings.
    #[must_use]
    pub fn data(&self) -> &str {
        match self {
            Self::Progress(payload) => payload,
            Self::Ping => "",
        }
    }

    /// Renders the frame as a server-sent event.
    #[must_use]
    pub fn to_sse(&self) -> String {
        let mut out = format!("event: {}\n", self.event_name());
        let data = self.data();
        if data.is_empty() {
            out.push_str("data: \n");
        } else {
            for line in data.lines() {
                let _ = writeln!(out, "data: {line}");
            }
        }
        out.push('\n');
        out
    }
}

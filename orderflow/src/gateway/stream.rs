//! Tails one order's topic for a long-lived client connection.

use async_stream::stream;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info};

use super::GatewayFrame;
use crate::cancellation::CancellationToken;
use crate::config::GatewayConfig;
use crate::core::OrderId;
use crate::errors::SinkError;
use crate::progress::{ProgressChannel, TopicSubscription};

/// Streams live order progress to any number of clients.
#[derive(Clone)]
pub struct StreamingGateway {
    channel: ProgressChannel,
    config: GatewayConfig,
}

impl StreamingGateway {
    /// Creates a gateway.
    pub fn new(channel: ProgressChannel, config: GatewayConfig) -> Self {
        Self { channel, config }
    }

    /// The gateway configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Opens a frame stream for one order.
    ///
    /// The topic subscription is taken before this returns, so nothing
    /// published afterwards is missed. Each poll forwards only the newest
    /// of the drained messages; an idle stream yields a ping once
    /// [`GatewayConfig::ping_after`] has passed since the last frame. The
    /// stream ends when `token` is cancelled and unsubscribes when dropped.
    pub fn stream(
        &self,
        order_id: OrderId,
        token: Arc<CancellationToken>,
    ) -> Result<impl Stream<Item = GatewayFrame> + Send + 'static, SinkError> {
        let mut guard = SubscriptionGuard {
            order_id,
            subscription: self.channel.subscribe(order_id)?,
        };
        info!(order_id, topic = %guard.subscription.topic(), "Gateway client subscribed");
        let config = self.config.clone();

        Ok(stream! {
            let mut last_frame = Instant::now();
            while !token.is_cancelled() {
                let drained = drain(&mut guard.subscription, config.drain_limit, config.recv_timeout()).await;
                if let Some(payload) = drained.latest {
                    last_frame = Instant::now();
                    yield GatewayFrame::Progress(payload);
                } else if last_frame.elapsed() >= config.ping_after() {
                    last_frame = Instant::now();
                    yield GatewayFrame::Ping;
                }
                if drained.closed {
                    debug!(order_id = guard.order_id, "Topic closed");
                    break;
                }
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(config.poll_interval()) => {}
                }
            }
        })
    }

    /// Like [`StreamingGateway::stream`], rendered as server-sent events.
    pub fn sse_stream(
        &self,
        order_id: OrderId,
        token: Arc<CancellationToken>,
    ) -> Result<impl Stream<Item = String> + Send + 'static, SinkError> {
        Ok(self.stream(order_id, token)?.map(|frame| frame.to_sse()))
    }
}

struct SubscriptionGuard {
    order_id: OrderId,
    subscription: TopicSubscription,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        info!(order_id = self.order_id, topic = %self.subscription.topic(), "Gateway client unsubscribed");
    }
}

#[derive(Default)]
struct Drained {
    latest: Option<String>,
    closed: bool,
}

/// Takes up to `limit` messages: the first waits at most `wait`, the rest
/// only what is already buffered.
async fn drain(subscription: &mut TopicSubscription, limit: usize, wait: Duration) -> Drained {
    let mut drained = Drained::default();
    for n in 0..limit.max(1) {
        let received = if n == 0 {
            match tokio::time::timeout(wait, subscription.recv()).await {
                Ok(received) => received,
                Err(_) => break,
            }
        } else {
            match subscription.try_recv() {
                Ok(message) => Ok(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => Err(RecvError::Closed),
                Err(TryRecvError::Lagged(skipped)) => Err(RecvError::Lagged(skipped)),
            }
        };
        match received {
            Ok(message) => drained.latest = Some(message),
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "Subscriber lagged, dropping older progress");
            }
            Err(RecvError::Closed) => {
                drained.closed = true;
                break;
            }
        }
    }
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::core::{ProgressEvent, StageName};
    use crate::progress::{BroadcastTopicBus, InMemoryLogStore, InMemoryOrderStore};
    use crate::testing::{test_channel, FailingLogStore, FailingOrderStore, FailingTopicBus};
    use pretty_assertions::assert_eq;

    fn fast_config() -> GatewayConfig {
        GatewayConfig {
            recv_timeout_ms: 5,
            ..GatewayConfig::default()
        }
        .with_poll_interval_ms(10)
        .with_ping_every(3)
    }

    fn event(pct: f64) -> ProgressEvent {
        ProgressEvent::running(1, StageName::RagEnrichment, "fetch", pct, format!("at {pct}"))
    }

    async fn next(stream: &mut (impl Stream<Item = GatewayFrame> + Unpin)) -> Option<GatewayFrame> {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_coalesces_burst_to_latest() {
        let (channel, _, _) = test_channel();
        let gateway = StreamingGateway::new(channel.clone(), fast_config());
        let stream = gateway.stream(1, Arc::new(CancellationToken::new())).unwrap();
        futures::pin_mut!(stream);

        for pct in [10.0, 20.0, 30.0, 40.0, 50.0] {
            channel.publish(&event(pct)).await;
        }

        let Some(GatewayFrame::Progress(payload)) = next(&mut stream).await else {
            panic!("expected a progress frame");
        };
        let received: ProgressEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(received, event(50.0));
    }

    #[tokio::test]
    async fn test_idle_stream_pings() {
        let (channel, _, _) = test_channel();
        let gateway = StreamingGateway::new(channel, fast_config());
        let stream = gateway.stream(1, Arc::new(CancellationToken::new())).unwrap();
        futures::pin_mut!(stream);

        assert_eq!(next(&mut stream).await, Some(GatewayFrame::Ping));
    }

    #[tokio::test]
    async fn test_cancel_ends_stream() {
        let (channel, _, _) = test_channel();
        let gateway = StreamingGateway::new(channel, fast_config().with_ping_every(1000));
        let token = Arc::new(CancellationToken::new());
        let stream = gateway.stream(1, token.clone()).unwrap();
        futures::pin_mut!(stream);

        token.cancel("client disconnected");

        assert_eq!(next(&mut stream).await, None);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let (channel, _, _) = test_channel();
        let gateway = StreamingGateway::new(channel.clone(), fast_config());

        let first = gateway.stream(1, Arc::new(CancellationToken::new())).unwrap();
        let second = gateway.stream(1, Arc::new(CancellationToken::new())).unwrap();
        assert_eq!(channel.subscriber_count(1), 2);

        drop(first);
        assert_eq!(channel.subscriber_count(1), 1);
        drop(second);
        assert_eq!(channel.subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn test_lagging_client_still_gets_latest() {
        let channel = ProgressChannel::new(
            Arc::new(InMemoryOrderStore::new()),
            Arc::new(InMemoryLogStore::new()),
            Arc::new(BroadcastTopicBus::new(4)),
            ChannelConfig::default(),
        );
        let gateway = StreamingGateway::new(channel.clone(), fast_config());
        let stream = gateway.stream(1, Arc::new(CancellationToken::new())).unwrap();
        futures::pin_mut!(stream);

        for pct in 1..=12 {
            channel.publish(&event(f64::from(pct))).await;
        }

        let Some(GatewayFrame::Progress(payload)) = next(&mut stream).await else {
            panic!("expected a progress frame");
        };
        let received: ProgressEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(received.progress_pct, 12.0);
    }

    #[tokio::test]
    async fn test_sse_rendering() {
        let (channel, _, _) = test_channel();
        let gateway = StreamingGateway::new(channel.clone(), fast_config());
        let stream = gateway.sse_stream(1, Arc::new(CancellationToken::new())).unwrap();
        futures::pin_mut!(stream);

        channel.publish(&event(5.0)).await;

        let frame = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(frame.starts_with("event: progress\ndata: {"));
        assert!(frame.ends_with("}\n\n"));
    }

    #[tokio::test]
    async fn test_unavailable_bus_is_an_error() {
        let channel = ProgressChannel::new(
            Arc::new(FailingOrderStore),
            Arc::new(FailingLogStore),
            Arc::new(FailingTopicBus),
            ChannelConfig::default(),
        );
        let gateway = StreamingGateway::new(channel, GatewayConfig::default());

        assert!(gateway.stream(1, Arc::new(CancellationToken::new())).is_err());
    }
}

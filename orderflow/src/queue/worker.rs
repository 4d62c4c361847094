//! Worker loop pulling dispatches off one stage queue.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use super::DispatchMessage;
use crate::cancellation::CancellationToken;
use crate::core::StageName;
use crate::errors::StageError;
use crate::runner::StageOutcome;

/// Executes one dispatched stage.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Runs the stage named by `message`, including any follow-up dispatch.
    async fn execute(&self, message: &DispatchMessage) -> Result<StageOutcome, StageError>;
}

/// Consumes one stage queue with at-least-once redelivery on failure.
#[derive(Clone)]
pub struct Worker {
    executor: Arc<dyn StageExecutor>,
    stage: StageName,
    max_retries: u32,
    concurrency: usize,
    retry_delay: Duration,
}

impl Worker {
    /// Creates a worker with one retry and one message in flight.
    pub fn new(executor: Arc<dyn StageExecutor>, stage: StageName) -> Self {
        Self {
            executor,
            stage,
            max_retries: 1,
            concurrency: 1,
            retry_delay: Duration::ZERO,
        }
    }

    /// Sets how many times a failing message is redelivered.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets how many messages run at once.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the pause before a redelivery.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// The stage this worker serves.
    #[must_use]
    pub fn stage(&self) -> StageName {
        self.stage
    }

    /// Executes a message, redelivering it up to `max_retries` times.
    ///
    /// Cancellation is final and never redelivered.
    pub async fn deliver(&self, mut message: DispatchMessage) -> Result<StageOutcome, StageError> {
        loop {
            match self.executor.execute(&message).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_cancelled() => {
                    info!(order_id = message.order_id, stage = %message.stage, "Dispatch ended by cancellation");
                    return Err(e);
                }
                Err(e) if message.attempt < self.max_retries => {
                    warn!(
                        order_id = message.order_id,
                        stage = %message.stage,
                        attempt = message.attempt,
                        error = %e,
                        "Stage failed, redelivering"
                    );
                    message.attempt += 1;
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(e) => {
                    error!(
                        order_id = message.order_id,
                        stage = %message.stage,
                        attempts = message.attempt + 1,
                        error = %e,
                        "Stage failed, retries exhausted"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Runs the worker loop until the token is cancelled or the queue closes.
    ///
    /// In-flight messages are awaited before the task finishes.
    pub fn spawn(self, mut rx: mpsc::Receiver<DispatchMessage>, token: Arc<CancellationToken>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(self.concurrency));
            let mut tasks = JoinSet::new();
            info!(stage = %self.stage, concurrency = self.concurrency, "Worker started");

            loop {
                let message = tokio::select! {
                    () = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(message) => message,
                        None => break,
                    },
                };
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let worker = self.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    // Failures are already persisted and logged by the runner.
                    let _ = worker.deliver(message).await;
                });
                while tasks.try_join_next().is_some() {}
            }

            while tasks.join_next().await.is_some() {}
            info!(stage = %self.stage, reason = ?token.reason(), "Worker stopped");
        })
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("stage", &self.stage)
            .field("max_retries", &self.max_retries)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::Value;

    /// Fails the first `failures` executions, then succeeds.
    struct FlakyExecutor {
        failures: u32,
        attempts: Mutex<Vec<u32>>,
        cancel: bool,
    }

    impl FlakyExecutor {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                attempts: Mutex::new(Vec::new()),
                cancel: false,
            }
        }
    }

    #[async_trait]
    impl StageExecutor for FlakyExecutor {
        async fn execute(&self, message: &DispatchMessage) -> Result<StageOutcome, StageError> {
            let calls = {
                let mut attempts = self.attempts.lock();
                attempts.push(message.attempt);
                attempts.len() as u32
            };
            if self.cancel {
                return Err(StageError::Cancelled {
                    order_id: message.order_id,
                    stage: message.stage,
                });
            }
            if calls <= self.failures {
                return Err(StageError::Precondition {
                    stage: message.stage,
                    message: "flaky".into(),
                });
            }
            Ok(StageOutcome::Completed)
        }
    }

    fn message() -> DispatchMessage {
        DispatchMessage::new(1, StageName::Preprocessing, Value::Null)
    }

    #[tokio::test]
    async fn test_redelivers_once() {
        let executor = Arc::new(FlakyExecutor::new(1));
        let worker = Worker::new(executor.clone(), StageName::Preprocessing);

        assert_eq!(worker.deliver(message()).await.unwrap(), StageOutcome::Completed);
        assert_eq!(*executor.attempts.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let executor = Arc::new(FlakyExecutor::new(5));
        let worker = Worker::new(executor.clone(), StageName::Preprocessing).with_max_retries(1);

        assert!(worker.deliver(message()).await.is_err());
        assert_eq!(executor.attempts.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_redelivered() {
        let executor = Arc::new(FlakyExecutor {
            cancel: true,
            ..FlakyExecutor::new(0)
        });
        let worker = Worker::new(executor.clone(), StageName::Preprocessing).with_max_retries(3);

        assert!(worker.deliver(message()).await.unwrap_err().is_cancelled());
        assert_eq!(executor.attempts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_loop_drains_until_closed() {
        let executor = Arc::new(FlakyExecutor::new(0));
        let (tx, rx) = mpsc::channel(8);
        let handle = Worker::new(executor.clone(), StageName::Preprocessing)
            .with_concurrency(2)
            .spawn(rx, Arc::new(CancellationToken::new()));

        for _ in 0..3 {
            tx.send(message()).await.unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(executor.attempts.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let (_tx, rx) = mpsc::channel::<DispatchMessage>(8);
        let token = Arc::new(CancellationToken::new());
        let handle = Worker::new(Arc::new(FlakyExecutor::new(0)), StageName::Preprocessing).spawn(rx, token.clone());

        token.cancel("shutdown");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

//! Named per-stage dispatch queues.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

use super::DispatchMessage;
use crate::core::{OrderId, StageName};
use crate::errors::ControllerError;

/// Where the controller sends stage dispatches.
#[async_trait]
pub trait StageQueue: Send + Sync {
    /// Enqueues a message on its stage's queue.
    async fn enqueue(&self, message: DispatchMessage) -> Result<(), ControllerError>;
}

/// In-process queues, one bounded channel per stage.
///
/// Every accepted message is also kept in a dispatch history.
pub struct InMemoryStageQueue {
    senders: HashMap<StageName, mpsc::Sender<DispatchMessage>>,
    receivers: Mutex<HashMap<StageName, mpsc::Receiver<DispatchMessage>>>,
    capacity: usize,
    dispatched: RwLock<Vec<DispatchMessage>>,
}

impl InMemoryStageQueue {
    /// Creates queues holding at most `capacity` pending messages each.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for stage in StageName::ALL {
            let (tx, rx) = mpsc::channel(capacity);
            senders.insert(stage, tx);
            receivers.insert(stage, rx);
        }
        Self {
            senders,
            receivers: Mutex::new(receivers),
            capacity,
            dispatched: RwLock::new(Vec::new()),
        }
    }

    /// Hands out a stage's receiving end. Returns `None` once taken.
    pub fn take_receiver(&self, stage: StageName) -> Option<mpsc::Receiver<DispatchMessage>> {
        self.receivers.lock().remove(&stage)
    }

    /// Messages waiting on a stage's queue.
    #[must_use]
    pub fn pending(&self, stage: StageName) -> usize {
        self.senders
            .get(&stage)
            .map_or(0, |tx| self.capacity - tx.capacity())
    }

    /// Every message accepted so far, in dispatch order.
    #[must_use]
    pub fn dispatched(&self) -> Vec<DispatchMessage> {
        self.dispatched.read().clone()
    }

    /// The stages dispatched for one order, in order.
    #[must_use]
    pub fn dispatched_stages(&self, order_id: OrderId) -> Vec<StageName> {
        self.dispatched
            .read()
            .iter()
            .filter(|m| m.order_id == order_id)
            .map(|m| m.stage)
            .collect()
    }
}

impl Default for InMemoryStageQueue {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl StageQueue for InMemoryStageQueue {
    async fn enqueue(&self, message: DispatchMessage) -> Result<(), ControllerError> {
        let queue = message.queue_name();
        let tx = self
            .senders
            .get(&message.stage)
            .ok_or_else(|| ControllerError::Dispatch {
                queue: queue.to_string(),
                message: "unknown queue".to_string(),
            })?;

        debug!(queue, order_id = message.order_id, task_id = %message.task_id, "Dispatching stage");
        self.dispatched.write().push(message.clone());
        tx.send(message).await.map_err(|_| ControllerError::Dispatch {
            queue: queue.to_string(),
            message: "queue closed".to_string(),
        })
    }
}

//! Per-subscription handler dispatch
//!
//! Each subscription gets its own worker task fed by a bounded queue. Ordering
//! within one subscription is preserved; handlers never run on the event loop.

use super::registry::SubscriptionId;
use crate::transport::InboundMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capability invoked for every message on a subscription
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: InboundMessage);
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(InboundMessage) + Send + Sync + 'static,
{
    async fn handle(&self, message: InboundMessage) {
        self(message)
    }
}

/// Result of handing a message to a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Worker queue full; message dropped
    Dropped,
    /// No worker for this subscription
    NoWorker,
}

struct Worker {
    queue: mpsc::Sender<InboundMessage>,
    task: JoinHandle<()>,
}

/// Owns one worker task per subscription
pub struct Dispatcher {
    capacity: usize,
    workers: HashMap<SubscriptionId, Worker>,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            workers: HashMap::new(),
        }
    }

    /// Spawn the worker for a subscription
    pub fn start(&mut self, id: SubscriptionId, topic: &str, handler: Arc<dyn MessageHandler>) {
        let (queue, mut rx) = mpsc::channel::<InboundMessage>(self.capacity);
        let topic = topic.to_string();

        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                handler.handle(message).await;
            }
            debug!(subscription = id, topic = %topic, "Handler worker stopped");
        });

        if let Some(previous) = self.workers.insert(id, Worker { queue, task }) {
            previous.task.abort();
        }
    }

    /// Stop accepting messages for a subscription; queued messages still run
    pub fn stop(&mut self, id: SubscriptionId) {
        self.workers.remove(&id);
    }

    pub fn deliver(&self, id: SubscriptionId, message: InboundMessage) -> Delivery {
        let Some(worker) = self.workers.get(&id) else {
            return Delivery::NoWorker;
        };

        match worker.queue.try_send(message) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(
                    subscription = id,
                    topic = %message.topic,
                    capacity = self.capacity,
                    "Handler queue full, dropping message"
                );
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::NoWorker,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Close every queue and wait up to `grace` for workers to finish
    pub async fn shutdown(&mut self, grace: Duration) {
        let tasks: Vec<JoinHandle<()>> = self.workers.drain().map(|(_, worker)| worker.task).collect();
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();

        let joined = tokio::time::timeout(grace, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;

        if joined.is_err() {
            warn!("Handler workers did not finish within {:?}, aborting", grace);
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

/// Messages delivered to a consumer, in publication order.
pub type Deliveries = mpsc::UnboundedReceiver<Vec<u8>>;

/// Message broker the router runs on top of.
///
/// Queues are point to point and keep messages until a consumer shows up. Exchanges are
/// fanout: every subscriber gets its own copy of each message, messages broadcast while
/// nobody is subscribed are lost.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> anyhow::Result<()>;

    /// Starts consuming `queue`. A queue has a single consumer at a time.
    async fn consume(&self, queue: &str) -> anyhow::Result<Deliveries>;

    async fn broadcast(&self, exchange: &str, payload: Vec<u8>) -> anyhow::Result<()>;

    async fn subscribe(&self, exchange: &str) -> anyhow::Result<Deliveries>;
}

struct Queue {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

/// Broker living inside the process, used when server and clients share a runtime.
#[derive(Default)]
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, Queue>>,
    exchanges: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let mut queues = self.queues.lock().await;
        let entry = queues.entry(queue.to_owned()).or_insert_with(Queue::new);
        if let Err(mpsc::error::SendError(payload)) = entry.sender.send(payload) {
            // the consumer went away, the message waits for the next one
            tracing::debug!("consumer of queue {} disconnected, recreating queue", queue);
            let fresh = Queue::new();
            fresh
                .sender
                .send(payload)
                .map_err(|_| anyhow!("could not publish to queue {}", queue))?;
            *entry = fresh;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> anyhow::Result<Deliveries> {
        let mut queues = self.queues.lock().await;
        let entry = queues.entry(queue.to_owned()).or_insert_with(Queue::new);
        entry
            .receiver
            .take()
            .ok_or_else(|| anyhow!("queue {} already has a consumer", queue))
    }

    async fn broadcast(&self, exchange: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let mut exchanges = self.exchanges.lock().await;
        if let Some(subscribers) = exchanges.get_mut(exchange) {
            subscribers.retain(|subscriber| subscriber.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, exchange: &str) -> anyhow::Result<Deliveries> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.exchanges
            .lock()
            .await
            .entry(exchange.to_owned())
            .or_default()
            .push(sender);
        Ok(receiver)
    }
}

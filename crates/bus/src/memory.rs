//! In-process broker on tokio channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::broker::{Acknowledge, Broker, Delivery, Message, Subscription};
use crate::error::BusError;

struct Queue {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Message>>>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
        }
    }
}

/// Broker keeping queues in memory. Consumers of one queue compete for
/// messages. Publishing to an undeclared queue declares it.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<String, Queue>>>,
    /// Number of messages accepted (for monitoring)
    publish_count: Arc<AtomicUsize>,
    failures_pending: Arc<AtomicUsize>,
    ack_failures_pending: Arc<AtomicUsize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail with a channel error.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` acknowledgements fail with a channel error.
    pub fn fail_next_acks(&self, count: usize) {
        self.ack_failures_pending.store(count, Ordering::SeqCst);
    }

    pub fn publish_count(&self) -> usize {
        self.publish_count.load(Ordering::Relaxed)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }

    fn with_queue<T>(&self, name: &str, f: impl FnOnce(&Queue) -> T) -> T {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let queue = queues.entry(name.to_string()).or_insert_with(Queue::new);
        f(queue)
    }

    fn take_injected_failure(&self) -> bool {
        take_one(&self.failures_pending)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, name: &str) -> Result<(), BusError> {
        self.with_queue(name, |_| ());
        Ok(())
    }

    async fn declare_exclusive_queue(&self) -> Result<String, BusError> {
        let name = format!("amq.gen-{}", Uuid::new_v4());
        self.declare_queue(&name).await?;
        Ok(name)
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), BusError> {
        if self.take_injected_failure() {
            return Err(BusError::Channel("injected publish failure".to_string()));
        }

        self.with_queue(queue, |q| q.sender.send(message))
            .map_err(|_| BusError::Closed)?;
        self.publish_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, BusError> {
        let (receiver, sender) = self.with_queue(queue, |q| (q.receiver.clone(), q.sender.clone()));
        Ok(Box::new(MemorySubscription {
            receiver,
            sender,
            ack_failures: self.ack_failures_pending.clone(),
        }))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BusError> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.remove(name);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("queues", &self.queue_names())
            .field("publish_count", &self.publish_count())
            .finish()
    }
}

struct MemorySubscription {
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Message>>>,
    sender: mpsc::UnboundedSender<Message>,
    ack_failures: Arc<AtomicUsize>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Result<Delivery, BusError>> {
        let message = self.receiver.lock().await.recv().await?;
        let acker = MemoryAcker {
            message: Mutex::new(Some(message.clone())),
            sender: self.sender.clone(),
            ack_failures: self.ack_failures.clone(),
        };
        Some(Ok(Delivery::new(message, Arc::new(acker))))
    }
}

struct MemoryAcker {
    message: Mutex<Option<Message>>,
    sender: mpsc::UnboundedSender<Message>,
    ack_failures: Arc<AtomicUsize>,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), BusError> {
        if take_one(&self.ack_failures) {
            return Err(BusError::Channel("injected ack failure".to_string()));
        }
        self.message.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), BusError> {
        let message = self.message.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let (true, Some(message)) = (requeue, message) {
            self.sender.send(message).map_err(|_| BusError::Closed)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageProperties;

    fn message(body: &str) -> Message {
        Message::new(body.as_bytes().to_vec(), MessageProperties::json())
    }

    #[tokio::test]
    async fn test_publish_consume() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q").await.unwrap();
        let mut subscription = broker.consume("q").await.unwrap();

        broker.publish("q", message("hello")).await.unwrap();

        let delivery = subscription.next().await.unwrap().unwrap();
        assert_eq!(delivery.message.body, b"hello");
        delivery.ack().await.unwrap();
        assert_eq!(broker.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_messages_buffer_before_consumer() {
        let broker = MemoryBroker::new();
        broker.publish("late", message("1")).await.unwrap();
        broker.publish("late", message("2")).await.unwrap();

        let mut subscription = broker.consume("late").await.unwrap();
        let first = subscription.next().await.unwrap().unwrap();
        let second = subscription.next().await.unwrap().unwrap();
        assert_eq!(first.message.body, b"1");
        assert_eq!(second.message.body, b"2");
    }

    #[tokio::test]
    async fn test_reject_requeues() {
        let broker = MemoryBroker::new();
        let mut subscription = broker.consume("q").await.unwrap();
        broker.publish("q", message("again")).await.unwrap();

        let delivery = subscription.next().await.unwrap().unwrap();
        delivery.reject(true).await.unwrap();

        let redelivered = subscription.next().await.unwrap().unwrap();
        assert_eq!(redelivered.message.body, b"again");
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(2);

        assert!(broker.publish("q", message("a")).await.is_err());
        assert!(broker.publish("q", message("b")).await.is_err());
        assert!(broker.publish("q", message("c")).await.is_ok());
        assert_eq!(broker.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_ack_failure() {
        let broker = MemoryBroker::new();
        let mut subscription = broker.consume("q").await.unwrap();
        broker.publish("q", message("a")).await.unwrap();
        broker.publish("q", message("b")).await.unwrap();
        broker.fail_next_acks(1);

        let first = subscription.next().await.unwrap().unwrap();
        assert!(first.ack().await.is_err());
        let second = subscription.next().await.unwrap().unwrap();
        assert!(second.ack().await.is_ok());
    }

    #[tokio::test]
    async fn test_exclusive_queue_names_are_unique() {
        let broker = MemoryBroker::new();
        let a = broker.declare_exclusive_queue().await.unwrap();
        let b = broker.declare_exclusive_queue().await.unwrap();
        assert_ne!(a, b);

        broker.delete_queue(&a).await.unwrap();
        assert_eq!(broker.queue_names(), vec![b]);
    }
}

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::{Broker, Message, MessageProperties};
use crate::config::BusConfig;
use crate::error::BusError;

struct Undelivered {
    queue: String,
    message: Message,
    attempts: u32,
    next_attempt: Instant,
}

/// Hive-side bus client: RPC over private reply queues, fire-and-forget
/// dispatch with a correlation id, and one-way publishes that are retried
/// when the broker refuses them.
#[derive(Clone)]
pub struct BusClient {
    broker: Arc<dyn Broker>,
    config: BusConfig,
    undelivered: Arc<Mutex<VecDeque<Undelivered>>>,
}

impl BusClient {
    pub fn new(broker: Arc<dyn Broker>, config: BusConfig) -> Self {
        Self {
            broker,
            config,
            undelivered: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Publishes `body` to `queue` and waits for the matching reply on a
    /// private callback queue.
    pub async fn rpc_call<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        body: &T,
    ) -> Result<Value, BusError> {
        let correlation_id = Uuid::new_v4().to_string();
        self.broker.declare_queue(queue).await?;
        let callback_queue = self.broker.declare_exclusive_queue().await?;
        let mut subscription = self.broker.consume(&callback_queue).await?;

        let properties = MessageProperties::json()
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(callback_queue.clone());
        let message = Message::json(body, properties)?;

        if let Err(e) = self.broker.publish(queue, message.clone()).await {
            tracing::warn!(queue, error = %e, "RPC publish failed, queued for redelivery");
            self.enqueue(queue, message).await;
        }

        let deadline = Instant::now() + self.config.message_timeout;
        let reply = loop {
            let delivery = match tokio::time::timeout_at(deadline, subscription.next()).await {
                Ok(Some(Ok(delivery))) => delivery,
                Ok(Some(Err(e))) => break Err(e),
                Ok(None) => break Err(BusError::Closed),
                Err(_) => {
                    break Err(BusError::RpcTimeout {
                        queue: queue.to_string(),
                        timeout_secs: self.config.message_timeout.as_secs(),
                    })
                }
            };

            if let Err(e) = delivery.ack().await {
                break Err(e);
            }
            if delivery.correlation_id() == Some(correlation_id.as_str()) {
                break delivery.json::<Value>();
            }
            tracing::debug!(queue = %callback_queue, "Discarding reply with foreign correlation id");
        };

        if let Err(e) = self.broker.delete_queue(&callback_queue).await {
            tracing::debug!(queue = %callback_queue, error = %e, "Failed to delete callback queue");
        }
        reply
    }

    /// Publishes an RPC request whose reply is routed to `reply_to` and
    /// handled by a separate consumer. Failures are returned, not retried.
    pub async fn rpc_send<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        body: &T,
        reply_to: &str,
        correlation_id: &str,
    ) -> Result<(), BusError> {
        let properties = MessageProperties::json()
            .with_correlation_id(correlation_id)
            .with_reply_to(reply_to);
        let message = Message::json(body, properties)?;

        self.broker.declare_queue(queue).await?;
        self.broker.publish(queue, message).await
    }

    /// One-way publish. A message the broker refuses is kept for redelivery.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        body: &T,
        properties: MessageProperties,
    ) -> Result<(), BusError> {
        let message = Message::json(body, properties)?;

        let result = match self.broker.declare_queue(queue).await {
            Ok(()) => self.broker.publish(queue, message.clone()).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(queue, error = %e, "Publish failed, queued for redelivery");
            self.enqueue(queue, message).await;
        }
        Ok(())
    }

    pub async fn undelivered_count(&self) -> usize {
        self.undelivered.lock().await.len()
    }

    async fn enqueue(&self, queue: &str, message: Message) {
        self.undelivered.lock().await.push_back(Undelivered {
            queue: queue.to_string(),
            message,
            attempts: 0,
            next_attempt: Instant::now(),
        });
    }

    /// Retries every undelivered message that is due. Returns how many were
    /// delivered.
    pub async fn redeliver(&self) -> usize {
        let now = Instant::now();
        let due: Vec<Undelivered> = {
            let mut queue = self.undelivered.lock().await;
            let (due, waiting): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|m| m.next_attempt <= now);
            *queue = waiting;
            due.into_iter().collect()
        };

        let mut delivered = 0;
        for mut pending in due {
            let result = match self.broker.declare_queue(&pending.queue).await {
                Ok(()) => {
                    self.broker
                        .publish(&pending.queue, pending.message.clone())
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    delivered += 1;
                    tracing::info!(queue = %pending.queue, attempts = pending.attempts + 1, "Redelivered message");
                }
                Err(e) => {
                    pending.attempts += 1;
                    if pending.attempts >= self.config.max_attempts {
                        tracing::error!(
                            queue = %pending.queue,
                            attempts = pending.attempts,
                            error = %e,
                            "Dropping message after maximum redelivery attempts"
                        );
                        continue;
                    }
                    let delay = self.config.backoff(pending.attempts);
                    tracing::warn!(queue = %pending.queue, attempts = pending.attempts, ?delay, error = %e, "Redelivery failed");
                    pending.next_attempt = Instant::now() + delay;
                    self.undelivered.lock().await.push_back(pending);
                }
            }
        }
        delivered
    }

    /// Runs [`Self::redeliver`] every redelivery interval until `shutdown` flips.
    pub async fn run_redelivery(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.redelivery_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.redeliver().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("Redelivery loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use serde_json::json;
    use std::time::Duration;

    fn client(broker: &MemoryBroker, config: BusConfig) -> BusClient {
        BusClient::new(Arc::new(broker.clone()), config)
    }

    /// Answers every request on `queue` with `{"echo": body}`.
    async fn spawn_responder(broker: MemoryBroker, queue: &str) {
        let mut subscription = broker.consume(queue).await.unwrap();
        tokio::spawn(async move {
            while let Some(Ok(delivery)) = subscription.next().await {
                delivery.ack().await.unwrap();
                let body: Value = delivery.json().unwrap();
                let properties = MessageProperties::json()
                    .with_correlation_id(delivery.correlation_id().unwrap());
                let reply = Message::json(&json!({"echo": body}), properties).unwrap();
                broker
                    .publish(delivery.reply_to().unwrap(), reply)
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_rpc_call_returns_matching_reply() {
        let broker = MemoryBroker::new();
        spawn_responder(broker.clone(), "control").await;
        let client = client(&broker, BusConfig::default());

        let reply = client
            .rpc_call("control", &json!({"event_t": "HEALTH_CHECK"}))
            .await
            .unwrap();
        assert_eq!(reply["echo"]["event_t"], "HEALTH_CHECK");
        // The callback queue is removed afterwards.
        assert_eq!(broker.queue_names(), vec!["control".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpc_call_times_out() {
        let broker = MemoryBroker::new();
        let client = client(
            &broker,
            BusConfig::default().with_message_timeout(Duration::from_secs(2)),
        );

        let result = client.rpc_call("nobody", &json!({})).await;
        assert!(matches!(
            result,
            Err(BusError::RpcTimeout { timeout_secs: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_rpc_call_ack_failure_removes_callback_queue() {
        let broker = MemoryBroker::new();
        let mut requests = broker.consume("control").await.unwrap();
        let responder = broker.clone();
        tokio::spawn(async move {
            let delivery = requests.next().await.unwrap().unwrap();
            let _ = delivery.ack().await;
            let properties = MessageProperties::json()
                .with_correlation_id(delivery.correlation_id().unwrap());
            let reply = Message::json(&json!({"ok": true}), properties).unwrap();
            responder
                .publish(delivery.reply_to().unwrap(), reply)
                .await
                .unwrap();
        });
        // One for the responder's ack, one for the client's.
        broker.fail_next_acks(2);
        let client = client(&broker, BusConfig::default());

        let result = client.rpc_call("control", &json!({})).await;
        assert!(matches!(result, Err(BusError::Channel(_))));
        assert_eq!(broker.queue_names(), vec!["control".to_string()]);
    }

    #[tokio::test]
    async fn test_rpc_send_attaches_correlation() {
        let broker = MemoryBroker::new();
        let mut subscription = broker.consume("attack").await.unwrap();
        let client = client(&broker, BusConfig::default());

        client
            .rpc_send("attack", &json!({"step_type": "worker-execute"}), "replies", "corr-1")
            .await
            .unwrap();

        let delivery = subscription.next().await.unwrap().unwrap();
        assert_eq!(delivery.correlation_id(), Some("corr-1"));
        assert_eq!(delivery.reply_to(), Some("replies"));
    }

    #[tokio::test]
    async fn test_rpc_send_failure_is_not_retried() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(1);
        let client = client(&broker, BusConfig::default());

        let result = client.rpc_send("attack", &json!({}), "replies", "c").await;
        assert!(result.is_err());
        assert_eq!(client.undelivered_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_publish_is_redelivered() {
        let broker = MemoryBroker::new();
        let mut subscription = broker.consume("events").await.unwrap();
        let client = client(&broker, BusConfig::default());

        broker.fail_next_publishes(1);
        client
            .publish("events", &json!({"n": 1}), MessageProperties::json())
            .await
            .unwrap();
        assert_eq!(client.undelivered_count().await, 1);

        assert_eq!(client.redeliver().await, 1);
        assert_eq!(client.undelivered_count().await, 0);

        let delivery = subscription.next().await.unwrap().unwrap();
        assert_eq!(delivery.json::<Value>().unwrap(), json!({"n": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_backs_off_and_gives_up() {
        let broker = MemoryBroker::new();
        let config = BusConfig::default().with_max_attempts(3);
        let client = client(&broker, config);

        broker.fail_next_publishes(100);
        client
            .publish("events", &json!({}), MessageProperties::json())
            .await
            .unwrap();

        assert_eq!(client.redeliver().await, 0);
        assert_eq!(client.undelivered_count().await, 1);

        // Backoff of 1s after the first failed retry: nothing is due yet.
        assert_eq!(client.redeliver().await, 0);
        assert_eq!(client.undelivered_count().await, 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        client.redeliver().await;
        tokio::time::advance(Duration::from_secs(2)).await;
        client.redeliver().await;
        assert_eq!(client.undelivered_count().await, 0);
    }
}

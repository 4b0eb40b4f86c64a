use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BusError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            ..Self::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl Message {
    pub fn new(body: Vec<u8>, properties: MessageProperties) -> Self {
        Self { body, properties }
    }

    pub fn json<T: serde::Serialize + ?Sized>(
        value: &T,
        properties: MessageProperties,
    ) -> Result<Self, BusError> {
        Ok(Self::new(serde_json::to_vec(value)?, properties))
    }
}

#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), BusError>;
    async fn reject(&self, requeue: bool) -> Result<(), BusError>;
}

/// A consumed message. Must be acknowledged once handled.
pub struct Delivery {
    pub message: Message,
    acker: Arc<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(message: Message, acker: Arc<dyn Acknowledge>) -> Self {
        Self { message, acker }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.message.properties.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.message.properties.reply_to.as_deref()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_slice(&self.message.body)?)
    }

    pub async fn ack(&self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), BusError> {
        self.acker.reject(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("properties", &self.message.properties)
            .field("body_len", &self.message.body.len())
            .finish()
    }
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. `None` once the consumer is cancelled.
    async fn next(&mut self) -> Option<Result<Delivery, BusError>>;
}

/// Queue-based message transport. Messages are routed to queues by name.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_queue(&self, name: &str) -> Result<(), BusError>;

    /// Declares a private queue with a broker-generated name, removed when
    /// the declaring connection goes away.
    async fn declare_exclusive_queue(&self) -> Result<String, BusError>;

    async fn publish(&self, queue: &str, message: Message) -> Result<(), BusError>;

    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, BusError>;

    async fn delete_queue(&self, name: &str) -> Result<(), BusError>;
}

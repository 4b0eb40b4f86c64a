//! RabbitMQ transport.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicRejectOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::broker::{Acknowledge, Broker, Delivery, Message, MessageProperties, Subscription};
use crate::error::BusError;

/// Broker over one AMQP connection. Publishes share a channel that is
/// reopened after a failure; each consumer gets its own channel.
pub struct AmqpBroker {
    connection: Connection,
    publish_channel: Mutex<Option<Channel>>,
}

impl AmqpBroker {
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        tracing::info!("Connected to AMQP broker");

        Ok(Self {
            connection,
            publish_channel: Mutex::new(None),
        })
    }

    async fn channel(&self) -> Result<Channel, BusError> {
        let mut guard = self.publish_channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = self.connection.create_channel().await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    async fn discard_channel(&self) {
        self.publish_channel.lock().await.take();
    }

    pub async fn close(&self) -> Result<(), BusError> {
        self.connection.close(200, "hive shutdown").await?;
        Ok(())
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    basic
}

fn from_basic_properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        correlation_id: properties.correlation_id().as_ref().map(|s| s.to_string()),
        reply_to: properties.reply_to().as_ref().map(|s| s.to_string()),
        content_type: properties.content_type().as_ref().map(|s| s.to_string()),
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, name: &str) -> Result<(), BusError> {
        let channel = self.channel().await?;
        channel
            .queue_declare(name, QueueDeclareOptions::default(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn declare_exclusive_queue(&self) -> Result<String, BusError> {
        let channel = self.channel().await?;
        let options = QueueDeclareOptions {
            exclusive: true,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };
        let queue = channel
            .queue_declare("", options, FieldTable::default())
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), BusError> {
        let channel = self.channel().await?;
        let result = async {
            channel
                .basic_publish(
                    "",
                    queue,
                    BasicPublishOptions::default(),
                    &message.body,
                    to_basic_properties(&message.properties),
                )
                .await?
                .await?;
            Ok::<_, lapin::Error>(())
        }
        .await;

        if let Err(e) = result {
            self.discard_channel().await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Subscription>, BusError> {
        let channel = self.connection.create_channel().await?;
        let consumer = channel
            .basic_consume(
                queue,
                &format!("cryton-hive-{}", Uuid::new_v4()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(Box::new(AmqpSubscription {
            _channel: channel,
            consumer,
        }))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BusError> {
        let channel = self.channel().await?;
        channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }
}

struct AmqpSubscription {
    _channel: Channel,
    consumer: Consumer,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next(&mut self) -> Option<Result<Delivery, BusError>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(e) => return Some(Err(e.into())),
        };

        let message = Message::new(
            delivery.data.clone(),
            from_basic_properties(&delivery.properties),
        );
        let acker = AmqpAcker(delivery.acker);
        Some(Ok(Delivery::new(message, Arc::new(acker))))
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<(), BusError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), BusError> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_mapping() {
        let properties = MessageProperties::json()
            .with_correlation_id("abc")
            .with_reply_to("cryton_hive.attack.response");

        let basic = to_basic_properties(&properties);
        assert_eq!(from_basic_properties(&basic), properties);
    }
}

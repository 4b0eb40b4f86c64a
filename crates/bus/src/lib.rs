//! Message bus for hive/worker communication.
//!
//! The [`Broker`] trait abstracts the transport; [`AmqpBroker`] talks to
//! RabbitMQ and [`MemoryBroker`] keeps queues in process. [`BusClient`] adds
//! RPC with reply queues and redelivery of failed publishes on top.

mod amqp;
mod broker;
mod client;
mod config;
mod envelope;
mod error;
mod memory;
mod queues;

pub use amqp::AmqpBroker;
pub use broker::{Acknowledge, Broker, Delivery, Message, MessageProperties, Subscription};
pub use client::BusClient;
pub use config::BusConfig;
pub use envelope::*;
pub use error::BusError;
pub use memory::MemoryBroker;
pub use queues::{HiveQueues, WorkerQueues};

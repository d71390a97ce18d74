//! The `transport` module is the seam between the client and the broker
//! protocol library.
//!
//! [`Connector`] opens one connection and one channel; [`BrokerChannel`]
//! exposes the handful of protocol operations the client needs. Two
//! implementations ship with the crate:
//!
//! - `amqp`: RabbitMQ over `lapin`.
//! - `memory`: an in-process broker for tests and single-process setups.

pub mod amqp;
pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::{mpsc, oneshot};

use crate::config::{MqOptions, Topic, Tuning};
use crate::utils::error::{MqError, Result};

pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

/// Broker verdict on one published message.
///
/// Delivery tags count accepted publishes on a channel, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub delivery_tag: u64,
    pub ack: bool,
}

/// Arguments for a consumer queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueArgs {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// `x-message-ttl`
    pub message_ttl: Option<Duration>,
    /// `x-expires`
    pub expires: Option<Duration>,
}

impl QueueArgs {
    /// Durable, shared queue with both expiry horizons taken from `tuning`.
    pub fn durable(tuning: &Tuning) -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            message_ttl: Some(tuning.message_ttl),
            expires: Some(tuning.queue_expires),
        }
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message handed to the consume handler. Nothing is acknowledged
/// automatically.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        redelivered: bool,
        body: Vec<u8>,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered,
            body,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// One protocol channel on an open connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable, non-auto-deleted exchange.
    async fn declare_exchange(&self, topic: &Topic) -> Result<()>;

    /// Delete `queue` regardless of its contents. Returns the purged message count.
    async fn delete_queue(&self, queue: &str) -> Result<u32>;

    /// Fails with [`MqError::QueueConflict`] when the queue exists with other arguments.
    async fn declare_queue(&self, queue: &str, args: &QueueArgs) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()>;

    /// Switch the channel into publisher confirm mode and return the stream
    /// of confirmations. The stream ends when the channel breaks.
    async fn enable_confirms(&self, buffer: usize) -> Result<mpsc::Receiver<Confirmation>>;

    /// Send one message. `expiration` becomes the per-message TTL.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        expiration: Duration,
    ) -> Result<()>;

    /// Start streaming deliveries from `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Resolves with the reason when the broker closes the channel. The
    /// sender is dropped without a value on a client-initiated close.
    fn notify_close(&self) -> oneshot::Receiver<MqError>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &MqOptions) -> Result<Arc<dyn BrokerChannel>>;
}

#[cfg(test)]
mod tests;

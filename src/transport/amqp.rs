//! RabbitMQ transport
//!
//! Implements the broker seam on top of `lapin`. Responsibilities:
//! - Dial the broker from `MqOptions` and open a single channel
//! - Translate topology and queue declarations into AMQP methods
//! - Turn lapin's per-publish confirmation futures into one ordered stream of
//!   `Confirmation { delivery_tag, ack }`, numbered like the broker numbers
//!   them (1, 2, 3, ... per channel)
//! - Fan channel and connection errors out to `notify_close` listeners

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation as LapinConfirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, oneshot};

use super::{Acker, BrokerChannel, Confirmation, Connector, Delivery, DeliveryStream, QueueArgs};
use crate::config::{ExchangeKind, MqOptions, Topic};
use crate::utils::error::{MqError, Result};

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, options: &MqOptions) -> Result<Arc<dyn BrokerChannel>> {
        let uri = amqp_uri(options)?;
        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(|e| MqError::Connect(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| MqError::Connect(format!("create channel: {e}")))?;

        Ok(Arc::new(AmqpChannel::new(connection, channel)))
    }
}

pub(crate) fn amqp_uri(options: &MqOptions) -> Result<AMQPUri> {
    let scheme = match options.scheme.as_str() {
        "amqp" => AMQPScheme::AMQP,
        "amqps" => AMQPScheme::AMQPS,
        other => return Err(MqError::Config(format!("unsupported scheme `{other}`"))),
    };

    Ok(AMQPUri {
        scheme,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: options.username.clone(),
                password: options.password.clone(),
            },
            host: options.host.clone(),
            port: options.port,
        },
        vhost: options.vhost.clone(),
        query: AMQPQueryString::default(),
    })
}

pub(crate) fn lapin_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        ExchangeKind::Custom(name) => lapin::ExchangeKind::Custom(name.clone()),
    }
}

pub(crate) fn queue_arguments(args: &QueueArgs) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(ttl) = args.message_ttl {
        table.insert("x-message-ttl".into(), AMQPValue::LongLongInt(millis(ttl)));
    }
    if let Some(expires) = args.expires {
        table.insert("x-expires".into(), AMQPValue::LongLongInt(millis(expires)));
    }
    table
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

type CloseListeners = Arc<Mutex<Vec<oneshot::Sender<MqError>>>>;
type ConfirmSender = Arc<Mutex<Option<mpsc::Sender<Confirmation>>>>;

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    next_tag: AtomicU64,
    confirms: ConfirmSender,
    close_listeners: CloseListeners,
}

impl AmqpChannel {
    fn new(connection: Connection, channel: Channel) -> Self {
        let confirms: ConfirmSender = Arc::new(Mutex::new(None));
        let close_listeners: CloseListeners = Arc::new(Mutex::new(Vec::new()));

        {
            let confirms = confirms.clone();
            let listeners = close_listeners.clone();
            channel.on_error(move |err| {
                broken(&confirms, &listeners, MqError::ChannelClosed(err.to_string()));
            });
        }
        {
            let confirms = confirms.clone();
            let listeners = close_listeners.clone();
            connection.on_error(move |err| {
                broken(
                    &confirms,
                    &listeners,
                    MqError::ChannelClosed(format!("connection: {err}")),
                );
            });
        }

        Self {
            connection,
            channel,
            next_tag: AtomicU64::new(1),
            confirms,
            close_listeners,
        }
    }
}

// The confirmation stream ends once every in-flight forwarder has finished.
fn broken(confirms: &ConfirmSender, listeners: &CloseListeners, reason: MqError) {
    confirms
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    let waiting: Vec<_> = listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain(..)
        .collect();
    for tx in waiting {
        let _ = tx.send(reason.clone());
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, topic: &Topic) -> Result<()> {
        self.channel
            .exchange_declare(
                &topic.exchange_name,
                lapin_kind(&topic.exchange_kind),
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MqError::Declare {
                what: "exchange",
                name: topic.exchange_name.clone(),
                reason: e.to_string(),
            })
    }

    async fn delete_queue(&self, queue: &str) -> Result<u32> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| MqError::Declare {
                what: "queue deletion",
                name: queue.to_string(),
                reason: e.to_string(),
            })
    }

    async fn declare_queue(&self, queue: &str, args: &QueueArgs) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: args.durable,
                    exclusive: args.exclusive,
                    auto_delete: args.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(args),
            )
            .await
            .map(|_| ())
            .map_err(|e| MqError::QueueConflict {
                queue: queue.to_string(),
                reason: e.to_string(),
            })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MqError::Declare {
                what: "queue binding",
                name: format!("{queue} <- {exchange} ({binding_key})"),
                reason: e.to_string(),
            })
    }

    async fn enable_confirms(&self, buffer: usize) -> Result<mpsc::Receiver<Confirmation>> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| MqError::Connect(format!("confirm mode: {e}")))?;

        let (tx, rx) = mpsc::channel(buffer);
        *self.confirms.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok(rx)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        expiration: Duration,
    ) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type("text/plain".into())
            .with_expiration(millis(expiration).to_string().into());

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| MqError::Send(e.to_string()))?;

        let sender = self
            .confirms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(tx) = sender {
            let delivery_tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                // An Err here means the channel broke; `broken` ends the stream.
                if let Ok(outcome) = confirm.await {
                    let ack = matches!(outcome, LapinConfirmation::Ack(_));
                    let _ = tx.send(Confirmation { delivery_tag, ack }).await;
                }
            });
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MqError::Consume(e.to_string()))?;

        let stream = consumer.map(|item| {
            item.map(|delivery| {
                Delivery::new(
                    delivery.delivery_tag,
                    delivery.exchange.as_str(),
                    delivery.routing_key.as_str(),
                    delivery.redelivered,
                    delivery.data,
                    Box::new(AmqpAcker(delivery.acker)),
                )
            })
            .map_err(|e| MqError::ChannelClosed(e.to_string()))
        });

        Ok(stream.boxed())
    }

    fn notify_close(&self) -> oneshot::Receiver<MqError> {
        let (tx, rx) = oneshot::channel();
        self.close_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    async fn close(&self) -> Result<()> {
        // Graceful close: listeners see their sender dropped, not an error.
        self.close_listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.confirms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        self.connection
            .close(200, "client closed")
            .await
            .map_err(|e| MqError::ChannelClosed(e.to_string()))
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| MqError::Consume(format!("ack: {e}")))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                multiple: false,
            })
            .await
            .map_err(|e| MqError::Consume(format!("nack: {e}")))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| MqError::Consume(format!("reject: {e}")))
    }
}

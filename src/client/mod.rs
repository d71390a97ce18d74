//! The broker client.
//!
//! An [`MqClient`] owns one connection and one channel. It declares the
//! configured exchanges on connect, publishes through the confirmation
//! engine in [`publish`], and, when built with [`MqClient::consumer`],
//! declares a per-device queue and streams its deliveries to a handler.

mod consume;
mod publish;
mod queue;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{OnceCell, oneshot};

use crate::config::{MqOptions, Topology, Tuning};
use crate::transport::{BrokerChannel, Connector};
use crate::utils::error::{MqError, Result};
use crate::utils::logging::{Field, LogContext, LogSink};
use crate::utils::shutdown::Shutdown;

use publish::{Confirms, Link, PublishEngine};

pub struct MqClient {
    options: MqOptions,
    device: Option<String>,
    queue: Option<String>,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    engine: Arc<PublishEngine>,
    shutdown: Shutdown,
    ctx: LogContext,
    log: Arc<dyn LogSink>,
    consuming: AtomicBool,
    teardown: OnceCell<()>,
    done: Mutex<Option<oneshot::Receiver<Result<()>>>>,
    outcome: OnceCell<Result<()>>,
}

impl MqClient {
    /// Connect, optionally enable confirm mode, and declare every exchange.
    pub async fn publisher(
        connector: &dyn Connector,
        options: &MqOptions,
        log: Arc<dyn LogSink>,
    ) -> Result<Self> {
        let mut client = Self::new(options, None, log)?;
        client.reconnect(connector).await?;
        Ok(client)
    }

    /// Like [`publisher`](Self::publisher), then declare and bind the queue
    /// for `device`.
    ///
    /// A queue that cannot be declared (typically because it exists with
    /// other arguments) is dropped and declared again on a new connection,
    /// once. A second failure is returned.
    pub async fn consumer(
        connector: &dyn Connector,
        options: &MqOptions,
        device: &str,
        log: Arc<dyn LogSink>,
    ) -> Result<Self> {
        let mut client = Self::new(options, Some(device), log)?;
        client.reconnect(connector).await?;

        if let Err(err) = client.init_queue(false).await {
            client.log.warn(
                &client.ctx,
                "queue declaration failed, retrying with a fresh queue",
                &[
                    Field::new("queue", client.queue_name().unwrap_or_default()),
                    Field::new("error", &err),
                ],
            );
            let retried = match client.reconnect(connector).await {
                Ok(()) => client.init_queue(true).await,
                Err(err) => Err(err),
            };
            if let Err(err) = retried {
                client.drop_channel().await;
                return Err(err);
            }
        }

        Ok(client)
    }

    fn new(options: &MqOptions, device: Option<&str>, log: Arc<dyn LogSink>) -> Result<Self> {
        options.validate().map_err(MqError::Config)?;
        let engine = Arc::new(PublishEngine::new(&options.tuning, Arc::clone(&log)));

        Ok(Self {
            options: options.clone(),
            device: device.map(str::to_string),
            queue: device.map(|d| options.topology.queue_name(d)),
            channel: RwLock::new(None),
            engine,
            shutdown: Shutdown::new(),
            ctx: LogContext::new(),
            log,
            consuming: AtomicBool::new(false),
            teardown: OnceCell::new(),
            done: Mutex::new(None),
            outcome: OnceCell::new(),
        })
    }

    /// Replace the channel with a freshly established one.
    ///
    /// The old channel, if any, is closed first. A publish worker still
    /// running on it keeps it until that worker stops.
    pub async fn reconnect(&mut self, connector: &dyn Connector) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(MqError::Cancelled);
        }
        self.engine.detach();
        self.drop_channel().await;

        let link = self.establish(connector).await?;
        let channel = Arc::clone(&link.channel);
        self.engine.attach(link);
        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = Some(channel);
        Ok(())
    }

    async fn establish(&self, connector: &dyn Connector) -> Result<Link> {
        let ctx = &self.ctx;
        let url = self.options.redacted_uri();
        self.log
            .info(ctx, "connecting to broker", &[Field::new("url", &url)]);

        let channel = connector.connect(&self.options).await.map_err(|err| {
            self.log.error(
                ctx,
                "broker connection failed",
                &[Field::new("url", &url), Field::new("error", &err)],
            );
            err
        })?;

        let confirms = if self.options.reliable {
            match channel.enable_confirms(self.options.tuning.confirm_buffer).await {
                Ok(rx) => {
                    self.log.info(ctx, "publisher confirms enabled", &[]);
                    Confirms::Stream(rx)
                }
                Err(err) => {
                    self.log.error(
                        ctx,
                        "enabling publisher confirms failed",
                        &[Field::new("error", &err)],
                    );
                    let _ = channel.close().await;
                    return Err(err);
                }
            }
        } else {
            Confirms::Unconfirmed
        };

        for topic in &self.options.topology.topics {
            let fields = [
                Field::new("exchange", &topic.exchange_name),
                Field::new("kind", &topic.exchange_kind),
            ];
            if let Err(err) = channel.declare_exchange(topic).await {
                let mut fields = fields.to_vec();
                fields.push(Field::new("error", &err));
                self.log.error(ctx, "exchange declaration failed", &fields);
                let _ = channel.close().await;
                return Err(err);
            }
            self.log.info(ctx, "exchange declared", &fields);
        }

        Ok(Link { channel, confirms })
    }

    /// Publish `payload` and wait for the broker's verdict.
    ///
    /// With confirm mode on, `Ok` means the broker acked this very message.
    /// Without it, `Ok` means the send went through. `expiration` becomes
    /// the message TTL and must be positive.
    pub async fn publish(
        &self,
        ctx: &LogContext,
        exchange: &str,
        routing_key: &str,
        expiration: Duration,
        payload: impl Into<Vec<u8>>,
    ) -> Result<()> {
        if expiration.is_zero() {
            return Err(MqError::InvalidExpiration);
        }
        self.engine
            .submit(
                &self.shutdown,
                ctx,
                exchange,
                routing_key,
                expiration,
                payload.into(),
            )
            .await
    }

    /// Tear the client down and wait for the consume handler, if any.
    ///
    /// Safe to call any number of times from any number of tasks; every
    /// call returns the same outcome: the handler's reported result, or
    /// `Ok(())` when nothing was consuming. A handler that ends without
    /// reporting, including one that panicked, yields `MqError::Handler`.
    pub async fn close(&self) -> Result<()> {
        self.teardown
            .get_or_init(|| async {
                self.engine.detach();
                self.drop_channel().await;
                self.shutdown.trigger();
                self.log.info(&self.ctx, "client closed", &[]);
            })
            .await;

        self.outcome
            .get_or_init(|| async {
                let done = self
                    .done
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                match done {
                    Some(done) => done.await.unwrap_or_else(|_| {
                        Err(MqError::Handler(
                            "handler exited without reporting".to_string(),
                        ))
                    }),
                    None => Ok(()),
                }
            })
            .await
            .clone()
    }

    /// Resolves once the client is shutting down, whether through
    /// [`close`](Self::close) or because the broker closed the channel.
    pub async fn cancelled(&self) {
        self.shutdown.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_triggered()
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// `<queue prefix>.<device>` for consumers.
    pub fn queue_name(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn topology(&self) -> &Topology {
        &self.options.topology
    }

    pub fn tuning(&self) -> &Tuning {
        &self.options.tuning
    }

    /// Correlation context for the client's own lifecycle records.
    pub fn context(&self) -> &LogContext {
        &self.ctx
    }

    /// Whether a publish worker is currently running.
    pub fn publishing(&self) -> bool {
        self.engine.worker_active()
    }

    fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn drop_channel(&self) {
        let channel = self
            .channel
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                self.log.warn(
                    &self.ctx,
                    "closing channel failed",
                    &[Field::new("error", &err)],
                );
            }
        }
    }
}

impl Drop for MqClient {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

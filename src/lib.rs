//! # mqclient
//!
//! `mqclient` is a reliable AMQP client: publishes wait for the broker's
//! confirmation of that exact message, and consumers get a durable
//! per-device queue streamed to a handler with manual acknowledgement.
//!
//! ## Core Modules
//!
//! - `client`: `MqClient`, the publish confirmation engine, queue setup and the consume loop.
//! - `config`: connection options, topology and tuning, loaded from a file plus `MQ_*` variables.
//! - `transport`: the broker seam, with a `lapin` adapter and an in-memory broker.
//! - `utils`: errors, the injected logging sink and the shutdown latch.

pub mod client;
pub mod config;
pub mod transport;
pub mod utils;

pub use client::MqClient;
pub use config::{ExchangeKind, MqOptions, Topic, Topology, Tuning, load_options};
pub use transport::{AmqpConnector, Delivery, DeliveryStream, MemoryBroker};
pub use utils::error::{ErrorKind, MqError, Result};
pub use utils::logging::{LogContext, LogSink, RecordingSink, TracingSink};

//! Error types shared by the whole client.
//!
//! Every failure a caller can observe maps onto one `MqError` variant, and
//! each variant belongs to exactly one [`ErrorKind`]. The enum is `Clone` so
//! a single outcome (for example the consume handler's result) can be handed
//! to every caller of `close`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqError>;

/// Coarse category of an [`MqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Dial, channel or declaration failure. Aborts construction.
    Connection,
    /// The consumer queue exists with incompatible arguments.
    QueueConflict,
    /// The publish request could not be queued in time.
    QueueFull,
    /// The broker rejected the message.
    Nacked,
    /// No confirmation arrived within the publish window.
    TimedOut,
    /// The client shut down or its publish worker died.
    Cancelled,
    /// The low-level send was refused before reaching the broker.
    Send,
    /// The broker closed the channel.
    ChannelClosed,
    /// Delivery streaming could not start or the handler reported a failure.
    Consume,
    /// Options failed validation.
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MqError {
    #[error("connect to broker: {0}")]
    Connect(String),

    #[error("declare {what} `{name}`: {reason}")]
    Declare {
        what: &'static str,
        name: String,
        reason: String,
    },

    #[error("queue `{queue}` conflicts with an existing declaration: {reason}")]
    QueueConflict { queue: String, reason: String },

    #[error("publish queue full")]
    QueueFull,

    #[error("publish nacked by broker")]
    Nacked,

    #[error("publish timed out waiting for confirmation")]
    TimedOut,

    #[error("publish cancelled: client is shutting down")]
    Cancelled,

    #[error("exchange publish: {0}")]
    Send(String),

    #[error("expiration parameter must be positive")]
    InvalidExpiration,

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("consume: {0}")]
    Consume(String),

    #[error("delivery handler: {0}")]
    Handler(String),

    #[error("client is not connected")]
    NotConnected,

    #[error("invalid options: {0}")]
    Config(String),
}

impl MqError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MqError::Connect(_) | MqError::Declare { .. } | MqError::NotConnected => {
                ErrorKind::Connection
            }
            MqError::QueueConflict { .. } => ErrorKind::QueueConflict,
            MqError::QueueFull => ErrorKind::QueueFull,
            MqError::Nacked => ErrorKind::Nacked,
            MqError::TimedOut => ErrorKind::TimedOut,
            MqError::Cancelled => ErrorKind::Cancelled,
            MqError::Send(_) | MqError::InvalidExpiration => ErrorKind::Send,
            MqError::ChannelClosed(_) => ErrorKind::ChannelClosed,
            MqError::Consume(_) | MqError::Handler(_) => ErrorKind::Consume,
            MqError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether publishing the same message again may succeed without any
    /// intervention on the client.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::QueueFull | ErrorKind::TimedOut)
    }
}

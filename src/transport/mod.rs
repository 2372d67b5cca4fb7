//! The boundary between the runtime and the AMQP client that actually talks to the broker.
//!
//! Pools, consumers and pipelines only ever see the traits defined here:
//!
//! - [`TransportFactory`] opens [`BrokerConnection`]s;
//! - a [`BrokerConnection`] multiplexes [`BrokerChannel`]s;
//! - a [`BrokerChannel`] registers consumers, which receive [`Delivery`]s through a
//!   [`DeliveryHandler`] and settle them through an [`Acker`].
//!
//! Recovery notifications are a capability, not a requirement: a connection that recovers on its
//! own exposes it via [`BrokerConnection::as_recoverable`]. Connections that don't simply return
//! `None` and the runtime falls back to rebuilding them.
//!
//! Two implementations ship with the crate:
//! - [`rabbit_mq`], backed by [`lapin`](https://docs.rs/lapin);
//! - [`memory`], an in-process broker used to exercise the runtime without RabbitMq.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

pub mod memory;
pub mod rabbit_mq;

/// Arguments attached to a consumer registration (`x-*` consume arguments in AMQP).
pub type ConsumeArguments = BTreeMap<String, String>;

/// Error returned by the broker boundary.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The connection or channel the operation targeted is no longer open.
    #[error("The broker connection or channel is closed")]
    Closed,
    /// The acknowledgement of a delivery was rejected (e.g. unknown delivery tag).
    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    #[error(transparent)]
    Lapin(#[from] lapin::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The subset of AMQP message properties the runtime cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// String-valued headers. Headers holding non-string values are not surfaced.
    pub headers: BTreeMap<String, String>,
}

/// A message pushed by the broker to a consumer.
pub struct Delivery {
    /// The delivery tag, unique within the channel the message was delivered on.
    pub delivery_tag: u64,
    /// The tag of the consumer registration the message was delivered to.
    pub consumer_tag: String,
    /// The exchange of the message. Empty if the default exchange was used.
    pub exchange: String,
    pub routing_key: String,
    /// Whether the message has been delivered before.
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    /// Used to settle the delivery with the broker.
    pub acker: Arc<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("consumer_tag", &self.consumer_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Settles a single delivery with the broker.
#[async_trait::async_trait]
pub trait Acker: Send + Sync + 'static {
    /// Positive acknowledgement: the broker can forget about the message.
    async fn ack(&self) -> Result<(), TransportError>;
    /// Negative acknowledgement, optionally putting the message back in the queue.
    async fn nack(&self, requeue: bool) -> Result<(), TransportError>;
    /// Rejection. Without requeue the message is dead-lettered (if configured) or discarded.
    async fn reject(&self, requeue: bool) -> Result<(), TransportError>;
}

/// Why a consumer registration stopped receiving deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The registration was cancelled, by us or by the broker.
    Cancelled,
    /// The channel carrying the registration was closed.
    ChannelClosed(String),
    /// The connection carrying the registration was lost.
    ConnectionLost(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "consumer cancelled"),
            Self::ChannelClosed(reason) => write!(f, "channel closed: {reason}"),
            Self::ConnectionLost(reason) => write!(f, "connection lost: {reason}"),
        }
    }
}

/// Receives the deliveries of a consumer registration.
///
/// `on_delivery` is awaited before the next delivery of the same registration is handed over:
/// a slow handler stalls the registration, which is how backpressure reaches the broker.
#[async_trait::async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn on_delivery(&self, delivery: Delivery);

    fn on_shutdown(&self, reason: ShutdownReason);
}

/// A logical session multiplexed over a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// The channel number, unique within its connection.
    fn channel_number(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Limit the number of unacknowledged deliveries pushed to consumers on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError>;

    /// Register a consumer on `queue`.
    ///
    /// Returns the consumer tag in effect, which is `consumer_tag` unless the broker picked one.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        arguments: ConsumeArguments,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, TransportError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A physical connection to the broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Access the recovery notifications of this connection, if it recovers on its own.
    fn as_recoverable(&self) -> Option<&dyn RecoverableConnection> {
        None
    }
}

/// A connection that re-establishes itself (and its channels and consumers) after a drop.
pub trait RecoverableConnection: Send + Sync {
    /// Subscribe to the connection's events.
    ///
    /// Listeners are held weakly: dropping the listener unsubscribes it.
    fn add_listener(&self, listener: Weak<dyn ConnectionListener>);
}

/// Observer of [`ConnectionEvent`]s.
pub trait ConnectionListener: Send + Sync {
    fn on_connection_event(&self, event: &ConnectionEvent);
}

/// Events raised by a [`RecoverableConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The transport dropped unexpectedly.
    Disconnected { reason: String },
    RecoveryStarted,
    RecoverySucceeded,
    RecoveryFailed { reason: String },
    /// A consumer registration is about to be replayed against the recovered connection.
    RecoveringConsumer {
        consumer_tag: String,
        arguments: ConsumeArguments,
    },
    /// A replayed consumer registration came back with a different tag.
    ConsumerTagChanged { before: String, after: String },
}

/// Opens connections to the broker.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    async fn new_connection(
        &self,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError>;
}

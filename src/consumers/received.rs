use crate::pool::ChannelHost;
use crate::transport::{Acker, Delivery, MessageProperties, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// A delivery pulled off a consumer's intake queue.
///
/// It is shared (`Arc<ReceivedMessage>`) between whoever processes it and whoever waits for its
/// processing to finish: [`ReceivedMessage::complete`] resolves [`ReceivedMessage::completion`].
///
/// A delivery can be settled (acked, nacked or rejected) at most once: AMQP closes the channel
/// of a client acknowledging the same delivery twice. The first settlement wins, later ones
/// return `false` without reaching the broker.
pub struct ReceivedMessage {
    delivery_tag: u64,
    consumer_tag: String,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    body: Vec<u8>,
    channel: Arc<ChannelHost>,
    acker: Arc<dyn Acker>,
    ackable: bool,
    settled: AtomicBool,
    completion: watch::Sender<bool>,
}

impl std::fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("delivery_tag", &self.delivery_tag)
            .field("consumer_tag", &self.consumer_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("channel_id", &self.channel.id())
            .field("ackable", &self.ackable)
            .field("settled", &self.settled())
            .finish()
    }
}

impl ReceivedMessage {
    pub(crate) fn new(delivery: Delivery, channel: Arc<ChannelHost>, ackable: bool) -> Self {
        let (completion, _) = watch::channel(false);
        Self {
            delivery_tag: delivery.delivery_tag,
            consumer_tag: delivery.consumer_tag,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            body: delivery.body,
            channel,
            acker: delivery.acker,
            ackable,
            settled: AtomicBool::new(false),
            completion,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// The tag of the consumer registration the message was delivered to.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// The raw payload. Decoding it is up to the caller.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id.as_deref()
    }

    /// Lookup a string header by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.properties.headers.get(name).map(String::as_str)
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// The channel the message was delivered on.
    pub fn channel(&self) -> &Arc<ChannelHost> {
        &self.channel
    }

    /// Whether the message must be settled explicitly.
    pub fn ackable(&self) -> bool {
        self.ackable
    }

    /// Whether the message has been settled already.
    pub fn settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    /// Acknowledge the message.
    ///
    /// Returns `false` if the message is not ackable, was settled already, or the broker refused
    /// the acknowledgement.
    pub async fn ack(&self) -> bool {
        if !self.claim_settlement() {
            return false;
        }
        self.report("ack", self.acker.ack().await)
    }

    /// Negatively acknowledge the message, optionally putting it back in its queue.
    pub async fn nack(&self, requeue: bool) -> bool {
        if !self.claim_settlement() {
            return false;
        }
        self.report("nack", self.acker.nack(requeue).await)
    }

    /// Reject the message, optionally putting it back in its queue.
    pub async fn reject(&self, requeue: bool) -> bool {
        if !self.claim_settlement() {
            return false;
        }
        self.report("reject", self.acker.reject(requeue).await)
    }

    fn claim_settlement(&self) -> bool {
        self.ackable && !self.settled.swap(true, Ordering::SeqCst)
    }

    fn report(&self, operation: &'static str, outcome: Result<(), TransportError>) -> bool {
        match outcome {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    delivery_tag = self.delivery_tag,
                    channel_id = self.channel.id(),
                    operation,
                    error = %e,
                    "Failed to settle message"
                );
                false
            }
        }
    }

    /// Signal that processing of the message is over.
    pub fn complete(&self) {
        self.completion.send_replace(true);
    }

    pub fn is_complete(&self) -> bool {
        *self.completion.borrow()
    }

    /// Wait for [`ReceivedMessage::complete`] to be called.
    pub async fn completion(&self) {
        let mut completion = self.completion.subscribe();
        // The sender lives as long as `self`: this cannot fail.
        let _ = completion.wait_for(|complete| *complete).await;
    }
}

//! An in-process broker implementing the broker boundary.
//!
//! [`MemoryBroker`] keeps queues in memory and pushes messages to consumers the way RabbitMq does:
//! it honours prefetch limits, tracks unacknowledged deliveries per channel and puts them back in
//! their queue (flagged as redelivered) when they are rejected with requeue or when their channel
//! goes away.
//!
//! It can also simulate transport disruption: [`MemoryBroker::drop_connections`] severs every
//! open connection and, for a broker built with [`MemoryBroker::recoverable`],
//! [`MemoryBroker::recover_connections`] re-establishes them, replays consumer registrations
//! under new consumer tags and raises the corresponding [`ConnectionEvent`]s.
//!
//! Every exchange behaves like the default exchange: a message is routed to the queue named
//! after its routing key.
use super::{
    Acker, BrokerChannel, BrokerConnection, ConnectionEvent, ConnectionListener, ConsumeArguments,
    Delivery, DeliveryHandler, MessageProperties, RecoverableConnection, ShutdownReason,
    TransportError, TransportFactory,
};
use crate::sync::lock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// An in-memory broker. Cloning it yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerState>,
}

struct BrokerState {
    recoverable: bool,
    queues: Mutex<HashMap<String, QueueState>>,
    connections: Mutex<Vec<Arc<ConnectionShared>>>,
    connections_opened: AtomicUsize,
    failing_connects: AtomicUsize,
    next_tag_suffix: AtomicU64,
    acked: AtomicUsize,
    discarded: AtomicUsize,
    unacked: AtomicUsize,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    body: Vec<u8>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker whose connections stay down once dropped.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A broker whose connections recover on their own and notify their listeners.
    pub fn recoverable() -> Self {
        Self::build(true)
    }

    fn build(recoverable: bool) -> Self {
        Self {
            inner: Arc::new(BrokerState {
                recoverable,
                queues: Mutex::new(HashMap::new()),
                connections: Mutex::new(Vec::new()),
                connections_opened: AtomicUsize::new(0),
                failing_connects: AtomicUsize::new(0),
                next_tag_suffix: AtomicU64::new(1),
                acked: AtomicUsize::new(0),
                discarded: AtomicUsize::new(0),
                unacked: AtomicUsize::new(0),
            }),
        }
    }

    /// Create `queue` if it does not exist yet.
    pub fn declare_queue(&self, queue: &str) {
        lock(&self.inner.queues)
            .entry(queue.to_owned())
            .or_default();
    }

    /// Publish a message to `queue` through the default exchange, declaring the queue if needed.
    pub fn publish(&self, queue: &str, body: impl Into<Vec<u8>>) {
        self.publish_with_properties(queue, body, MessageProperties::default());
    }

    pub fn publish_with_properties(
        &self,
        queue: &str,
        body: impl Into<Vec<u8>>,
        properties: MessageProperties,
    ) {
        self.inner.enqueue(
            queue,
            StoredMessage {
                exchange: String::new(),
                routing_key: queue.to_owned(),
                redelivered: false,
                properties,
                body: body.into(),
            },
        );
    }

    /// Number of messages waiting in `queue` to be delivered.
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.inner.queues)
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    /// Number of deliveries pushed to consumers and not settled yet.
    pub fn unacked_count(&self) -> usize {
        self.inner.unacked.load(Ordering::SeqCst)
    }

    /// Number of deliveries positively acknowledged so far.
    pub fn acked_count(&self) -> usize {
        self.inner.acked.load(Ordering::SeqCst)
    }

    /// Number of deliveries rejected (or nacked) without requeue so far.
    pub fn discarded_count(&self) -> usize {
        self.inner.discarded.load(Ordering::SeqCst)
    }

    /// Number of connections opened since the broker was created.
    pub fn connections_opened(&self) -> usize {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> usize {
        lock(&self.inner.connections)
            .iter()
            .filter(|c| c.is_open())
            .count()
    }

    /// Refuse the next `attempts` connection attempts.
    pub fn fail_next_connections(&self, attempts: usize) {
        self.inner
            .failing_connects
            .store(attempts, Ordering::SeqCst);
    }

    /// Sever every open connection, as a network failure would.
    ///
    /// Channels are closed, their unacknowledged deliveries go back to their queues and every
    /// consumer is notified with [`ShutdownReason::ConnectionLost`].
    pub fn drop_connections(&self, reason: &str) {
        let connections = lock(&self.inner.connections).clone();
        for connection in connections.iter().filter(|c| c.is_open()) {
            connection.sever(&self.inner, reason);
        }
    }

    /// Re-establish the connections severed by [`MemoryBroker::drop_connections`].
    ///
    /// Only connections of a [`MemoryBroker::recoverable`] broker come back: their channels are
    /// reopened and their consumers are re-registered under a new consumer tag.
    pub fn recover_connections(&self) {
        if !self.inner.recoverable {
            return;
        }
        let connections = lock(&self.inner.connections).clone();
        for connection in connections.iter().filter(|c| c.is_severed()) {
            connection.recover(&self.inner);
        }
    }
}

impl BrokerState {
    fn enqueue(&self, queue: &str, message: StoredMessage) {
        let notify = {
            let mut queues = lock(&self.queues);
            let queue = queues.entry(queue.to_owned()).or_default();
            queue.ready.push_back(message);
            Arc::clone(&queue.notify)
        };
        notify.notify_waiters();
    }

    fn requeue(&self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        let notify = {
            let mut queues = lock(&self.queues);
            let queue = queues.entry(queue.to_owned()).or_default();
            queue.ready.push_front(message);
            Arc::clone(&queue.notify)
        };
        notify.notify_waiters();
    }

    fn pop(&self, queue: &str) -> Option<StoredMessage> {
        lock(&self.queues).get_mut(queue)?.ready.pop_front()
    }

    fn queue_notify(&self, queue: &str) -> Option<Arc<Notify>> {
        lock(&self.queues)
            .get(queue)
            .map(|q| Arc::clone(&q.notify))
    }

    fn wake(&self, queue: &str) {
        if let Some(notify) = self.queue_notify(queue) {
            notify.notify_waiters();
        }
    }
}

#[async_trait::async_trait]
impl TransportFactory for MemoryBroker {
    async fn new_connection(
        &self,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let refuse = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(anyhow::anyhow!("Connection refused: {connection_name}").into());
        }
        let shared = Arc::new(ConnectionShared {
            name: connection_name.to_owned(),
            state: Mutex::new(ConnectionState {
                status: LinkStatus::Open,
                next_channel_number: 1,
                channels: Vec::new(),
            }),
            listeners: Mutex::new(Vec::new()),
        });
        lock(&self.inner.connections).push(Arc::clone(&shared));
        self.inner.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            shared,
            broker: Arc::clone(&self.inner),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkStatus {
    Open,
    /// Dropped by the broker, may come back through recovery.
    Severed,
    Closed,
}

struct ConnectionShared {
    name: String,
    state: Mutex<ConnectionState>,
    listeners: Mutex<Vec<Weak<dyn ConnectionListener>>>,
}

struct ConnectionState {
    status: LinkStatus,
    next_channel_number: u16,
    channels: Vec<Arc<ChannelShared>>,
}

impl ConnectionShared {
    fn is_open(&self) -> bool {
        lock(&self.state).status == LinkStatus::Open
    }

    fn is_severed(&self) -> bool {
        lock(&self.state).status == LinkStatus::Severed
    }

    fn emit(&self, event: ConnectionEvent) {
        let listeners: Vec<_> = {
            let mut listeners = lock(&self.listeners);
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.on_connection_event(&event);
        }
    }

    fn sever(&self, broker: &Arc<BrokerState>, reason: &str) {
        let channels = {
            let mut state = lock(&self.state);
            state.status = LinkStatus::Severed;
            state.channels.clone()
        };
        for channel in channels {
            channel.shut_down(
                broker,
                LinkStatus::Severed,
                ShutdownReason::ConnectionLost(reason.to_owned()),
            );
        }
        tracing::debug!(connection = %self.name, "Memory broker dropped the connection");
        self.emit(ConnectionEvent::Disconnected {
            reason: reason.to_owned(),
        });
    }

    fn recover(&self, broker: &Arc<BrokerState>) {
        self.emit(ConnectionEvent::RecoveryStarted);
        let channels = {
            let mut state = lock(&self.state);
            state.status = LinkStatus::Open;
            state.channels.clone()
        };
        for channel in channels {
            let registrations = {
                let mut state = lock(&channel.state);
                if state.status != LinkStatus::Severed {
                    continue;
                }
                state.status = LinkStatus::Open;
                std::mem::take(&mut state.consumers)
            };
            for (before, registration) in registrations {
                self.emit(ConnectionEvent::RecoveringConsumer {
                    consumer_tag: before.clone(),
                    arguments: registration.arguments.clone(),
                });
                let suffix = broker.next_tag_suffix.fetch_add(1, Ordering::SeqCst);
                let after = format!("{before}.r{suffix}");
                channel.register(broker, after.clone(), registration.respawn());
                self.emit(ConnectionEvent::ConsumerTagChanged { before, after });
            }
        }
        self.emit(ConnectionEvent::RecoverySucceeded);
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    shared: Arc<ConnectionShared>,
    broker: Arc<BrokerState>,
}

#[async_trait::async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let mut state = lock(&self.shared.state);
        if state.status != LinkStatus::Open {
            return Err(TransportError::Closed);
        }
        state
            .channels
            .retain(|c| lock(&c.state).status != LinkStatus::Closed);
        let number = state.next_channel_number;
        state.next_channel_number = number.wrapping_add(1).max(1);
        let channel = Arc::new(ChannelShared {
            number,
            state: Mutex::new(ChannelState {
                status: LinkStatus::Open,
                prefetch: 0,
                next_delivery_tag: 1,
                unacked: HashMap::new(),
                consumers: HashMap::new(),
            }),
        });
        state.channels.push(Arc::clone(&channel));
        Ok(Arc::new(MemoryChannel {
            shared: channel,
            broker: Arc::clone(&self.broker),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let channels = {
            let mut state = lock(&self.shared.state);
            state.status = LinkStatus::Closed;
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            channel.shut_down(
                &self.broker,
                LinkStatus::Closed,
                ShutdownReason::ConnectionLost("connection closed by client".into()),
            );
        }
        Ok(())
    }

    fn as_recoverable(&self) -> Option<&dyn RecoverableConnection> {
        if self.broker.recoverable {
            Some(self)
        } else {
            None
        }
    }
}

impl RecoverableConnection for MemoryConnection {
    fn add_listener(&self, listener: Weak<dyn ConnectionListener>) {
        lock(&self.shared.listeners).push(listener);
    }
}

struct ChannelShared {
    number: u16,
    state: Mutex<ChannelState>,
}

struct ChannelState {
    status: LinkStatus,
    prefetch: u16,
    next_delivery_tag: u64,
    unacked: HashMap<u64, Unacked>,
    consumers: HashMap<String, Registration>,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct Registration {
    queue: String,
    auto_ack: bool,
    arguments: ConsumeArguments,
    handler: Arc<dyn DeliveryHandler>,
    cancel: CancellationToken,
}

impl Registration {
    fn respawn(self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            ..self
        }
    }
}

impl ChannelShared {
    fn register(self: &Arc<Self>, broker: &Arc<BrokerState>, tag: String, registration: Registration) {
        let dispatcher = Dispatcher {
            channel: Arc::clone(self),
            broker: Arc::clone(broker),
            queue: registration.queue.clone(),
            consumer_tag: tag.clone(),
            auto_ack: registration.auto_ack,
            handler: Arc::clone(&registration.handler),
            cancel: registration.cancel.clone(),
        };
        lock(&self.state).consumers.insert(tag, registration);
        tokio::spawn(dispatcher.run());
    }

    /// Stop every consumer of the channel and requeue its unacknowledged deliveries.
    ///
    /// A severed channel keeps its consumer registrations around to replay them on recovery.
    fn shut_down(&self, broker: &BrokerState, status: LinkStatus, reason: ShutdownReason) {
        let (unacked, handlers) = {
            let mut state = lock(&self.state);
            if state.status != LinkStatus::Open {
                return;
            }
            state.status = status;
            let handlers: Vec<_> = state
                .consumers
                .values()
                .map(|r| {
                    r.cancel.cancel();
                    Arc::clone(&r.handler)
                })
                .collect();
            if status == LinkStatus::Closed {
                state.consumers.clear();
            }
            (std::mem::take(&mut state.unacked), handlers)
        };
        broker.unacked.fetch_sub(unacked.len(), Ordering::SeqCst);
        let mut unacked: Vec<_> = unacked.into_iter().collect();
        // Oldest deliveries end up at the head of the queue.
        unacked.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, Unacked { queue, message }) in unacked {
            broker.requeue(&queue, message);
        }
        for handler in handlers {
            handler.on_shutdown(reason.clone());
        }
    }
}

/// A channel of a [`MemoryConnection`].
pub struct MemoryChannel {
    shared: Arc<ChannelShared>,
    broker: Arc<BrokerState>,
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    fn channel_number(&self) -> u16 {
        self.shared.number
    }

    fn is_open(&self) -> bool {
        lock(&self.shared.state).status == LinkStatus::Open
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        let mut state = lock(&self.shared.state);
        if state.status != LinkStatus::Open {
            return Err(TransportError::Closed);
        }
        state.prefetch = prefetch_count;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        arguments: ConsumeArguments,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, TransportError> {
        if self.broker.queue_notify(queue).is_none() {
            return Err(anyhow::anyhow!("NOT_FOUND - no queue '{queue}'").into());
        }
        let tag = if consumer_tag.is_empty() {
            format!("amq.ctag-{}", uuid::Uuid::new_v4())
        } else {
            consumer_tag.to_owned()
        };
        {
            let state = lock(&self.shared.state);
            if state.status != LinkStatus::Open {
                return Err(TransportError::Closed);
            }
            if state.consumers.contains_key(&tag) {
                return Err(anyhow::anyhow!("NOT_ALLOWED - reused consumer tag '{tag}'").into());
            }
        }
        self.shared.register(
            &self.broker,
            tag.clone(),
            Registration {
                queue: queue.to_owned(),
                auto_ack,
                arguments,
                handler,
                cancel: CancellationToken::new(),
            },
        );
        Ok(tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let registration = {
            let mut state = lock(&self.shared.state);
            if state.status != LinkStatus::Open {
                return Err(TransportError::Closed);
            }
            state.consumers.remove(consumer_tag)
        };
        if let Some(registration) = registration {
            registration.cancel.cancel();
            registration.handler.on_shutdown(ShutdownReason::Cancelled);
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.broker.enqueue(
            routing_key,
            StoredMessage {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                redelivered: false,
                properties,
                body: body.to_vec(),
            },
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.shut_down(
            &self.broker,
            LinkStatus::Closed,
            ShutdownReason::ChannelClosed("channel closed by client".into()),
        );
        Ok(())
    }
}

/// Pushes the messages of a queue to one consumer registration.
struct Dispatcher {
    channel: Arc<ChannelShared>,
    broker: Arc<BrokerState>,
    queue: String,
    consumer_tag: String,
    auto_ack: bool,
    handler: Arc<dyn DeliveryHandler>,
    cancel: CancellationToken,
}

impl Dispatcher {
    async fn run(self) {
        let Some(notify) = self.broker.queue_notify(&self.queue) else {
            return;
        };
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.cancel.is_cancelled() {
                return;
            }
            match self.next_delivery() {
                Some(delivery) => self.handler.on_delivery(delivery).await,
                None => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = self.cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    fn next_delivery(&self) -> Option<Delivery> {
        {
            let state = lock(&self.channel.state);
            if state.status != LinkStatus::Open {
                return None;
            }
            let prefetch = usize::from(state.prefetch);
            if !self.auto_ack && prefetch > 0 && state.unacked.len() >= prefetch {
                return None;
            }
        }
        let message = self.broker.pop(&self.queue)?;

        let delivery_tag = {
            let mut state = lock(&self.channel.state);
            if state.status != LinkStatus::Open || self.cancel.is_cancelled() {
                None
            } else {
                let delivery_tag = state.next_delivery_tag;
                state.next_delivery_tag += 1;
                if !self.auto_ack {
                    state.unacked.insert(
                        delivery_tag,
                        Unacked {
                            queue: self.queue.clone(),
                            message: message.clone(),
                        },
                    );
                }
                Some(delivery_tag)
            }
        };
        let Some(delivery_tag) = delivery_tag else {
            self.broker.requeue(&self.queue, message);
            return None;
        };
        if self.auto_ack {
            self.broker.acked.fetch_add(1, Ordering::SeqCst);
        } else {
            self.broker.unacked.fetch_add(1, Ordering::SeqCst);
        }

        Some(Delivery {
            delivery_tag,
            consumer_tag: self.consumer_tag.clone(),
            exchange: message.exchange,
            routing_key: message.routing_key,
            redelivered: message.redelivered,
            properties: message.properties,
            body: message.body,
            acker: Arc::new(MemoryAcker {
                channel: Arc::downgrade(&self.channel),
                broker: Arc::clone(&self.broker),
                delivery_tag,
            }),
        })
    }
}

struct MemoryAcker {
    channel: Weak<ChannelShared>,
    broker: Arc<BrokerState>,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self) -> Result<Unacked, TransportError> {
        let channel = self.channel.upgrade().ok_or(TransportError::Closed)?;
        let mut state = lock(&channel.state);
        if state.status != LinkStatus::Open {
            return Err(TransportError::Closed);
        }
        let unacked = state
            .unacked
            .remove(&self.delivery_tag)
            .ok_or(TransportError::UnknownDeliveryTag(self.delivery_tag))?;
        self.broker.unacked.fetch_sub(1, Ordering::SeqCst);
        Ok(unacked)
    }

    fn dispose(&self, unacked: Unacked, requeue: bool) {
        if requeue {
            self.broker.requeue(&unacked.queue, unacked.message);
        } else {
            self.broker.discarded.fetch_add(1, Ordering::SeqCst);
            self.broker.wake(&unacked.queue);
        }
    }
}

#[async_trait::async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        let unacked = self.settle()?;
        self.broker.acked.fetch_add(1, Ordering::SeqCst);
        self.broker.wake(&unacked.queue);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        let unacked = self.settle()?;
        self.dispose(unacked, requeue);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        let unacked = self.settle()?;
        self.dispose(unacked, requeue);
        Ok(())
    }
}

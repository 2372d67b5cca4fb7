//! [`ChannelHost`] and the [`Manager`] implementation that pools them.
use super::{connection::ConnectionHost, ConnectionPool, Error};
use crate::sync::lock;
use crate::transport::{BrokerChannel, ConnectionEvent, ConnectionListener, ConsumeArguments};
use deadpool::managed::{self, Manager};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio_util::sync::CancellationToken;

/// Consume argument carrying the recovery id of a [`ChannelHost`].
pub const RECOVERY_ID_ARGUMENT: &str = "x-recovery-id";

/// Wraps one channel of a [`ConnectionHost`].
///
/// Channels created on a connection that recovers on its own get a unique recovery id. Consumers
/// registered with [`ChannelHost::consume_arguments`] carry it, which lets the host pick up the
/// tag their registration was given after a recovery (see
/// [`ChannelHost::recovered_consumer_tag`]).
pub struct ChannelHost {
    id: u64,
    ackable: bool,
    transient: bool,
    connection: Weak<ConnectionHost>,
    channel: RwLock<Arc<dyn BrokerChannel>>,
    recovery_id: Option<String>,
    state: Mutex<ChannelHostState>,
}

#[derive(Debug, Default)]
struct ChannelHostState {
    recovering: bool,
    recovering_consumer_tag: Option<String>,
    recovered_consumer_tag: Option<String>,
}

impl std::fmt::Debug for ChannelHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHost")
            .field("id", &self.id)
            .field("channel_number", &self.channel_number())
            .field("ackable", &self.ackable)
            .field("transient", &self.transient)
            .field("recovery_id", &self.recovery_id)
            .finish()
    }
}

impl ChannelHost {
    /// Open a new channel on `connection`.
    pub async fn create(
        id: u64,
        connection: &Arc<ConnectionHost>,
        ackable: bool,
        transient: bool,
    ) -> Result<Arc<Self>, Error> {
        let channel = connection.create_channel().await?;
        let recovery_id = connection
            .recoverable()
            .then(|| uuid::Uuid::new_v4().to_string());
        let host = Arc::new(Self {
            id,
            ackable,
            transient,
            connection: Arc::downgrade(connection),
            channel: RwLock::new(channel),
            recovery_id,
            state: Mutex::new(ChannelHostState::default()),
        });
        let listener: Weak<ChannelHost> = Arc::downgrade(&host);
        connection.subscribe(listener);
        tracing::debug!(
            channel_id = id,
            channel_number = host.channel_number(),
            connection_id = connection.id(),
            ackable,
            transient,
            "Channel opened"
        );
        Ok(host)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The number of the wrapped channel, unique within its connection.
    pub fn channel_number(&self) -> u16 {
        self.channel().channel_number()
    }

    /// Whether consumers on this channel settle their deliveries explicitly.
    pub fn ackable(&self) -> bool {
        self.ackable
    }

    /// Whether the channel was minted for one-off use, outside of the pools.
    pub fn transient(&self) -> bool {
        self.transient
    }

    pub fn recovery_id(&self) -> Option<&str> {
        self.recovery_id.as_deref()
    }

    /// The channel currently wrapped by the host.
    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        Arc::clone(&self.channel.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// The connection the channel belongs to, unless the pool has been dropped.
    pub fn connection(&self) -> Option<Arc<ConnectionHost>> {
        self.connection.upgrade()
    }

    /// Whether the channel can be used: open, on a healthy connection, and not recovering.
    pub fn healthy(&self) -> bool {
        if self.recovering() {
            return false;
        }
        let connection_healthy = self
            .connection()
            .map_or(false, |connection| connection.healthy());
        connection_healthy && self.channel().is_open()
    }

    pub fn recovering(&self) -> bool {
        lock(&self.state).recovering
    }

    /// The consumer tag replayed by the broker client during the last recovery.
    pub fn recovering_consumer_tag(&self) -> Option<String> {
        lock(&self.state).recovering_consumer_tag.clone()
    }

    /// The consumer tag in effect after the last recovery, for the consumer registered with
    /// [`ChannelHost::consume_arguments`].
    pub fn recovered_consumer_tag(&self) -> Option<String> {
        lock(&self.state).recovered_consumer_tag.clone()
    }

    /// Same as [`ChannelHost::recovered_consumer_tag`], clearing the recovery state.
    pub fn take_recovered_consumer_tag(&self) -> Option<String> {
        let mut state = lock(&self.state);
        state.recovering_consumer_tag = None;
        state.recovered_consumer_tag.take()
    }

    /// Arguments to attach to consumers registered on this channel.
    pub fn consume_arguments(&self) -> ConsumeArguments {
        let mut arguments = ConsumeArguments::new();
        if let Some(recovery_id) = &self.recovery_id {
            arguments.insert(RECOVERY_ID_ARGUMENT.to_owned(), recovery_id.clone());
        }
        arguments
    }

    /// Replace the wrapped channel with a new one opened on the same connection.
    ///
    /// Fails if the connection is not healthy: rebuilding connections is the pool's business.
    #[tracing::instrument(name = "channel_host_rebuild", skip(self), fields(channel_id = self.id))]
    pub async fn rebuild(&self) -> Result<(), Error> {
        let connection = self.connection().ok_or(Error::Closed)?;
        if !connection.healthy() {
            return Err(anyhow::anyhow!("Connection {} is not healthy", connection.id()).into());
        }
        let channel = connection.create_channel().await?;
        let stale = std::mem::replace(
            &mut *self.channel.write().unwrap_or_else(|e| e.into_inner()),
            channel,
        );
        *lock(&self.state) = ChannelHostState::default();
        if let Err(e) = stale.close().await {
            tracing::debug!(error = %e, "Failed to close a stale channel");
        }
        tracing::info!(
            channel_id = self.id,
            channel_number = self.channel_number(),
            "Channel rebuilt"
        );
        Ok(())
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.channel().close().await?;
        Ok(())
    }
}

impl ConnectionListener for ChannelHost {
    fn on_connection_event(&self, event: &ConnectionEvent) {
        let mut state = lock(&self.state);
        match event {
            ConnectionEvent::RecoveryStarted => state.recovering = true,
            ConnectionEvent::RecoveringConsumer {
                consumer_tag,
                arguments,
            } => {
                let ours = self.recovery_id.is_some()
                    && arguments.get(RECOVERY_ID_ARGUMENT) == self.recovery_id.as_ref();
                if ours {
                    state.recovering_consumer_tag = Some(consumer_tag.clone());
                    state.recovered_consumer_tag = None;
                }
            }
            ConnectionEvent::ConsumerTagChanged { before, after } => {
                if state.recovering_consumer_tag.as_deref() == Some(before.as_str()) {
                    tracing::debug!(channel_id = self.id, %before, %after, "Consumer tag changed");
                    state.recovered_consumer_tag = Some(after.clone());
                }
            }
            ConnectionEvent::RecoverySucceeded => {
                state.recovering = false;
                // The registration kept its tag.
                if state.recovered_consumer_tag.is_none() {
                    state.recovered_consumer_tag = state.recovering_consumer_tag.clone();
                }
            }
            ConnectionEvent::RecoveryFailed { .. } => state.recovering = false,
            ConnectionEvent::Disconnected { .. } => {}
        }
    }
}

/// Pool of long-lived [`ChannelHost`]s of one kind (ackable or not).
pub(crate) type FixedChannelPool = deadpool::managed::Pool<ChannelManager>;

/// Implements [`Manager`] to pool [`ChannelHost`]s, spreading them over the connections of a
/// [`ConnectionPool`].
pub(crate) struct ChannelManager {
    connections: Arc<ConnectionPool>,
    ackable: bool,
    next_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl ChannelManager {
    pub(crate) fn new(
        connections: Arc<ConnectionPool>,
        ackable: bool,
        next_id: Arc<AtomicU64>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connections,
            ackable,
            next_id,
            shutdown,
        }
    }
}

#[async_trait::async_trait]
impl Manager for ChannelManager {
    type Type = Arc<ChannelHost>;
    type Error = Error;

    async fn create(&self) -> Result<Arc<ChannelHost>, Error> {
        let connection = self.connections.get_connection(&self.shutdown).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        ChannelHost::create(id, &connection, self.ackable, false).await
    }

    async fn recycle(&self, host: &mut Arc<ChannelHost>) -> managed::RecycleResult<Error> {
        if host.healthy() {
            return Ok(());
        }
        if host.recovering() {
            return Err(managed::RecycleError::StaticMessage(
                "Channel is being recovered",
            ));
        }
        match host.rebuild().await {
            Ok(()) if host.healthy() => Ok(()),
            outcome => {
                if let Err(e) = host.close().await {
                    tracing::debug!(channel_id = host.id(), error = %e, "Failed to close channel");
                }
                Err(managed::RecycleError::Message(format!(
                    "Channel {} is not in an healthy state: {:?}",
                    host.id(),
                    outcome.err()
                )))
            }
        }
    }
}

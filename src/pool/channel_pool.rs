use super::channel::{ChannelHost, ChannelManager, FixedChannelPool};
use super::connection::ConnectionHost;
use super::{ConnectionPool, Error, PoolOptions};
use crate::transport::TransportFactory;
use deadpool::managed::{Object, PoolError};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A [`ChannelHost`] checked out of a [`ChannelPool`].
///
/// Hand it back with [`ChannelPool::return_channel`]. Dropping it returns it to the pool as if it
/// were returned without error.
pub struct PooledChannel(Object<ChannelManager>);

impl Deref for PooledChannel {
    type Target = ChannelHost;

    fn deref(&self) -> &ChannelHost {
        &self.0
    }
}

impl PooledChannel {
    /// A shared handle on the underlying host, e.g. to hand it to a delivery callback.
    pub fn host(&self) -> Arc<ChannelHost> {
        Arc::clone(&self.0)
    }
}

/// Checkout counters of one of the fixed pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Maximum number of channels the pool can hold.
    pub max_size: usize,
    /// Number of channels currently owned by the pool, idle or checked out.
    pub size: usize,
    /// Number of idle channels.
    pub available: usize,
    /// Number of checked out channels.
    pub in_use: usize,
}

impl From<deadpool::Status> for PoolStatus {
    fn from(status: deadpool::Status) -> Self {
        let available = status.available.max(0) as usize;
        Self {
            max_size: status.max_size,
            size: status.size,
            available,
            in_use: status.size.saturating_sub(available),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPoolStatus {
    pub ackable: PoolStatus,
    pub plain: PoolStatus,
    /// Number of transient channels minted so far.
    pub transient_created: u64,
}

/// Owns two fixed pools of long-lived channels, one ackable and one not, and mints transient
/// channels on demand.
///
/// Pooled channels are spread over the connections of a [`ConnectionPool`] round robin.
/// At most `connections × channels_per_connection` channels of each kind are checked out at any
/// time: further acquisitions wait for a channel to be returned.
pub struct ChannelPool {
    connections: Arc<ConnectionPool>,
    ackable: FixedChannelPool,
    plain: FixedChannelPool,
    next_transient_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ChannelPool {
    /// Open the connections described by `options` and set up the channel pools on top of them.
    pub async fn new(
        factory: Arc<dyn TransportFactory>,
        options: PoolOptions,
    ) -> Result<Self, Error> {
        options.validate()?;
        let connections = ConnectionPool::new(factory, options).await?;
        Self::from_connection_pool(Arc::new(connections))
    }

    /// Set up channel pools on top of an existing [`ConnectionPool`].
    pub fn from_connection_pool(connections: Arc<ConnectionPool>) -> Result<Self, Error> {
        let options = connections.options().clone();
        let shutdown = CancellationToken::new();
        let next_id = Arc::new(AtomicU64::new(0));
        let build = |ackable: bool| {
            let manager = ChannelManager::new(
                Arc::clone(&connections),
                ackable,
                Arc::clone(&next_id),
                shutdown.clone(),
            );
            FixedChannelPool::builder(manager)
                .max_size(options.max_channels(ackable))
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to build the channel pool: {e}"))
        };
        let ackable = build(true)?;
        let plain = build(false)?;
        Ok(Self {
            ackable,
            plain,
            next_transient_id: AtomicU64::new(options.transient_channel_id_offset),
            connections,
            shutdown,
        })
    }

    pub fn connections(&self) -> &Arc<ConnectionPool> {
        &self.connections
    }

    pub fn options(&self) -> &PoolOptions {
        self.connections.options()
    }

    fn fixed_pool(&self, ackable: bool) -> &FixedChannelPool {
        if ackable {
            &self.ackable
        } else {
            &self.plain
        }
    }

    /// Check out a non-ackable channel.
    pub async fn get_channel(&self, cancel: &CancellationToken) -> Result<PooledChannel, Error> {
        self.acquire(false, cancel).await
    }

    /// Check out an ackable channel.
    pub async fn get_ackable_channel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PooledChannel, Error> {
        self.acquire(true, cancel).await
    }

    /// Check out a healthy channel of the requested kind.
    ///
    /// Waits while every channel is checked out. Unhealthy channels are rebuilt before being
    /// handed out, retrying every `sleep_on_error` until it succeeds or `cancel` fires.
    #[tracing::instrument(name = "channel_pool_get", skip(self, cancel))]
    pub async fn acquire(
        &self,
        ackable: bool,
        cancel: &CancellationToken,
    ) -> Result<PooledChannel, Error> {
        let pool = self.fixed_pool(ackable);
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.shutdown.cancelled() => return Err(Error::Closed),
                outcome = pool.get() => outcome,
            };
            match outcome {
                Ok(channel) => return Ok(PooledChannel(channel)),
                Err(PoolError::Closed) => return Err(Error::Closed),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to acquire a channel, retrying");
                    self.pause(cancel).await?;
                }
            }
        }
    }

    /// Hand a channel back.
    ///
    /// A channel returned with `had_error` is closed and removed from the pool. Its slot is
    /// filled again by a new channel on a later acquisition.
    #[tracing::instrument(name = "channel_pool_return", skip(self, channel), fields(channel_id = channel.id()))]
    pub async fn return_channel(&self, channel: PooledChannel, had_error: bool) {
        if !had_error {
            return;
        }
        let host = Object::take(channel.0);
        if let Err(e) = host.close().await {
            tracing::debug!(channel_id = host.id(), error = %e, "Failed to close discarded channel");
        }
    }

    /// Mint a channel for one-off use on the next connection of the rotation.
    ///
    /// Transient channels never enter the fixed pools: the caller owns them and is responsible
    /// for closing them.
    #[tracing::instrument(name = "channel_pool_get_transient", skip(self, cancel))]
    pub async fn get_transient_channel(
        &self,
        ackable: bool,
        cancel: &CancellationToken,
    ) -> Result<Arc<ChannelHost>, Error> {
        loop {
            let connection = self.connections.get_connection(cancel).await?;
            let id = self.next_transient_id.fetch_add(1, Ordering::SeqCst);
            match ChannelHost::create(id, &connection, ackable, true).await {
                Ok(host) => return Ok(host),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to create a transient channel, retrying");
                    self.pause(cancel).await?;
                }
            }
        }
    }

    /// Wait for `host` to be usable again after a disruption.
    ///
    /// Recoveries carried out by the broker client are waited for. Otherwise the connection and
    /// then the channel are rebuilt in place.
    #[tracing::instrument(name = "channel_pool_wait_until_healthy", skip_all, fields(channel_id = host.id()))]
    pub async fn wait_until_healthy(
        &self,
        host: &ChannelHost,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let window = self.options().recovery_window();
        loop {
            if self.shutdown.is_cancelled() {
                return Err(Error::Closed);
            }
            if host.healthy() {
                return Ok(());
            }
            let connection = host.connection().ok_or(Error::Closed)?;
            if host.recovering() || connection.awaiting_recovery(window) {
                tracing::debug!(channel_id = host.id(), "Waiting for the channel to recover");
            } else {
                let restored = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    restored = self.restore(host, &connection, cancel) => restored,
                };
                match restored {
                    Ok(()) if host.healthy() => return Ok(()),
                    Ok(()) => {}
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => tracing::warn!(
                        channel_id = host.id(),
                        error = %e,
                        "Failed to rebuild the channel, retrying"
                    ),
                }
            }
            self.pause(cancel).await?;
        }
    }

    async fn restore(
        &self,
        host: &ChannelHost,
        connection: &Arc<ConnectionHost>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.connections.ensure_healthy(connection, cancel).await?;
        host.rebuild().await
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<(), Error> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = self.shutdown.cancelled() => Err(Error::Closed),
            _ = tokio::time::sleep(self.options().sleep_on_error()) => Ok(()),
        }
    }

    pub fn status(&self) -> ChannelPoolStatus {
        let transient_created = self
            .next_transient_id
            .load(Ordering::SeqCst)
            .saturating_sub(self.options().transient_channel_id_offset);
        ChannelPoolStatus {
            ackable: self.ackable.status().into(),
            plain: self.plain.status().into(),
            transient_created,
        }
    }

    /// Number of channels of the given kind currently checked out.
    pub fn in_use(&self, ackable: bool) -> usize {
        PoolStatus::from(self.fixed_pool(ackable).status()).in_use
    }

    /// Number of idle channels of the given kind.
    pub fn available(&self, ackable: bool) -> usize {
        PoolStatus::from(self.fixed_pool(ackable).status()).available
    }

    /// Close the fixed pools, then every connection.
    #[tracing::instrument(name = "channel_pool_shutdown", skip_all)]
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.ackable.close();
        self.plain.close();
        self.connections.shutdown().await;
    }
}

//! [`ConnectionHost`] and the round-robin [`ConnectionPool`].
use super::{Error, PoolOptions};
use crate::sync::lock;
use crate::transport::{
    BrokerChannel, BrokerConnection, ConnectionEvent, ConnectionListener, TransportFactory,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Wraps one physical connection to the broker and tracks its health.
///
/// When the underlying connection recovers on its own, the host follows the recovery events to
/// know whether it should wait for the broker client or rebuild the connection itself.
pub struct ConnectionHost {
    id: u64,
    name: String,
    factory: Arc<dyn TransportFactory>,
    connection: RwLock<Arc<dyn BrokerConnection>>,
    state: Mutex<ConnectionHostState>,
    channel_listeners: Mutex<Vec<Weak<dyn ConnectionListener>>>,
    rebuild_lock: tokio::sync::Mutex<()>,
}

#[derive(Debug, Default)]
struct ConnectionHostState {
    healthy: bool,
    recoverable: bool,
    recovering: bool,
    recovered: bool,
    dropped_at: Option<Instant>,
}

impl ConnectionHost {
    #[tracing::instrument(name = "connection_host_open", skip(factory))]
    async fn open(
        id: u64,
        name: String,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Arc<Self>, Error> {
        let connection = factory.new_connection(&name).await?;
        let host = Arc::new(Self {
            id,
            name,
            factory,
            connection: RwLock::new(Arc::clone(&connection)),
            state: Mutex::new(ConnectionHostState {
                healthy: true,
                recoverable: connection.as_recoverable().is_some(),
                ..Default::default()
            }),
            channel_listeners: Mutex::new(Vec::new()),
            rebuild_lock: tokio::sync::Mutex::new(()),
        });
        host.listen_to(connection.as_ref());
        Ok(host)
    }

    fn listen_to(self: &Arc<Self>, connection: &dyn BrokerConnection) {
        if let Some(recoverable) = connection.as_recoverable() {
            let listener: Weak<ConnectionHost> = Arc::downgrade(self);
            recoverable.add_listener(listener);
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The connection currently wrapped by the host.
    pub fn connection(&self) -> Arc<dyn BrokerConnection> {
        Arc::clone(&self.connection.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Whether the connection is open and not in the middle of a recovery.
    pub fn healthy(&self) -> bool {
        let healthy = {
            let state = lock(&self.state);
            state.healthy && !state.recovering
        };
        healthy && self.connection().is_open()
    }

    /// Whether the wrapped connection recovers on its own.
    pub fn recoverable(&self) -> bool {
        lock(&self.state).recoverable
    }

    pub fn recovering(&self) -> bool {
        lock(&self.state).recovering
    }

    /// Whether the last disruption of the connection was healed by the broker client.
    pub fn recovered(&self) -> bool {
        lock(&self.state).recovered
    }

    /// Whether the broker client is expected to bring the connection back on its own.
    ///
    /// True while a recovery is in progress, or for `window` after an unexpected drop of a
    /// recoverable connection.
    pub fn awaiting_recovery(&self, window: Duration) -> bool {
        let state = lock(&self.state);
        state.recoverable
            && (state.recovering
                || state
                    .dropped_at
                    .map_or(false, |dropped_at| dropped_at.elapsed() < window))
    }

    /// Forward the events of the wrapped connection (current and future ones) to `listener`.
    ///
    /// Listeners that have been dropped are forgotten.
    pub fn subscribe(&self, listener: Weak<dyn ConnectionListener>) {
        let mut listeners = lock(&self.channel_listeners);
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    /// How many listeners the host holds on to, dropped ones included until the next prune.
    pub fn subscribed_listeners(&self) -> usize {
        lock(&self.channel_listeners).len()
    }

    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, Error> {
        Ok(self.connection().create_channel().await?)
    }

    /// Replace the wrapped connection with a fresh one, unless it is healthy already.
    ///
    /// A failed rebuild leaves the host unhealthy.
    #[tracing::instrument(name = "connection_host_rebuild", skip(self), fields(connection_id = self.id))]
    pub async fn rebuild(self: &Arc<Self>) -> Result<(), Error> {
        let _guard = self.rebuild_lock.lock().await;
        if self.healthy() {
            return Ok(());
        }
        let stale = self.connection();
        if let Err(e) = stale.close().await {
            tracing::debug!(error = %e, "Failed to close a stale connection");
        }
        let connection = self.factory.new_connection(&self.name).await?;
        *self.connection.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&connection);
        {
            let mut state = lock(&self.state);
            *state = ConnectionHostState {
                healthy: true,
                recoverable: connection.as_recoverable().is_some(),
                ..Default::default()
            };
        }
        self.listen_to(connection.as_ref());
        tracing::info!(connection_id = self.id, "Connection rebuilt");
        Ok(())
    }

    pub async fn close(&self) -> Result<(), Error> {
        lock(&self.state).healthy = false;
        self.connection().close().await?;
        Ok(())
    }
}

impl ConnectionListener for ConnectionHost {
    fn on_connection_event(&self, event: &ConnectionEvent) {
        {
            let mut state = lock(&self.state);
            match event {
                ConnectionEvent::Disconnected { reason } => {
                    tracing::warn!(connection_id = self.id, %reason, "Connection dropped");
                    state.healthy = false;
                    state.recovered = false;
                    state.dropped_at = Some(Instant::now());
                }
                ConnectionEvent::RecoveryStarted => {
                    state.recovering = true;
                    state.recovered = false;
                }
                ConnectionEvent::RecoverySucceeded => {
                    tracing::info!(connection_id = self.id, "Connection recovered");
                    state.healthy = true;
                    state.recovering = false;
                    state.recovered = true;
                    state.dropped_at = None;
                }
                ConnectionEvent::RecoveryFailed { reason } => {
                    tracing::warn!(connection_id = self.id, %reason, "Connection recovery failed");
                    state.recovering = false;
                    state.dropped_at = None;
                }
                ConnectionEvent::RecoveringConsumer { .. }
                | ConnectionEvent::ConsumerTagChanged { .. } => {}
            }
        }
        let listeners: Vec<_> = {
            let mut listeners = lock(&self.channel_listeners);
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.on_connection_event(event);
        }
    }
}

/// Owns a fixed set of [`ConnectionHost`]s and hands them out round robin.
pub struct ConnectionPool {
    hosts: Vec<Arc<ConnectionHost>>,
    cursor: Mutex<usize>,
    options: PoolOptions,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Open `options.connections` connections to the broker.
    #[tracing::instrument(name = "connection_pool_new", skip_all, fields(connections = options.connections))]
    pub async fn new(
        factory: Arc<dyn TransportFactory>,
        options: PoolOptions,
    ) -> Result<Self, Error> {
        let mut hosts = Vec::with_capacity(options.connections);
        for id in 0..options.connections as u64 {
            let name = format!("{}-{id}", options.connection_name);
            hosts.push(ConnectionHost::open(id, name, Arc::clone(&factory)).await?);
        }
        Ok(Self {
            hosts,
            cursor: Mutex::new(0),
            options,
            closed: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn hosts(&self) -> &[Arc<ConnectionHost>] {
        &self.hosts
    }

    fn next_host(&self) -> Result<Arc<ConnectionHost>, Error> {
        let mut cursor = lock(&self.cursor);
        let host = self.hosts.get(*cursor % self.hosts.len().max(1)).ok_or(Error::Closed)?;
        *cursor = cursor.wrapping_add(1);
        Ok(Arc::clone(host))
    }

    /// Get the next connection in the rotation, waiting for it to be healthy.
    ///
    /// An unhealthy connection is rebuilt in place, retrying every `sleep_on_error` until it
    /// succeeds or `cancel` fires.
    #[tracing::instrument(name = "connection_pool_get", skip_all)]
    pub async fn get_connection(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<ConnectionHost>, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let host = self.next_host()?;
        self.ensure_healthy(&host, cancel).await?;
        Ok(host)
    }

    /// Wait for `host` to be healthy, rebuilding it if the broker client does not.
    pub async fn ensure_healthy(
        &self,
        host: &Arc<ConnectionHost>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            if host.healthy() {
                return Ok(());
            }
            if host.awaiting_recovery(self.options.recovery_window()) {
                tracing::debug!(connection_id = host.id(), "Waiting for the connection to recover");
            } else {
                let rebuilt = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    rebuilt = host.rebuild() => rebuilt,
                };
                match rebuilt {
                    Ok(()) if host.healthy() => return Ok(()),
                    Ok(()) => {}
                    Err(e) => tracing::warn!(
                        connection_id = host.id(),
                        error = %e,
                        "Failed to rebuild the connection, retrying"
                    ),
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.options.sleep_on_error()) => {}
            }
        }
    }

    /// Close every connection. Failures are logged and skipped.
    #[tracing::instrument(name = "connection_pool_shutdown", skip_all)]
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for host in &self.hosts {
            if let Err(e) = host.close().await {
                tracing::debug!(connection_id = host.id(), error = %e, "Failed to close connection");
            }
        }
    }
}

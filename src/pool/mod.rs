//! Pooling of broker connections and channels.
//!
//! - [`ConnectionPool`] owns a fixed set of [`ConnectionHost`]s and hands them out round robin,
//!   rebuilding the ones that went down;
//! - [`ChannelPool`] pools long-lived [`ChannelHost`]s on top of it, using [`deadpool`], one pool
//!   for ackable channels and one for the others, and mints transient channels on demand.
//!
//! ```rust,no_run
//! use carrot_conveyor::amqp::configuration::RabbitMqSettings;
//! use carrot_conveyor::amqp::ConnectionFactory;
//! use carrot_conveyor::pool::{ChannelPool, PoolOptions};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     let settings = RabbitMqSettings::default();
//!     let factory = ConnectionFactory::new_from_config(&settings)?;
//!     let pool = ChannelPool::new(Arc::new(factory), PoolOptions::default()).await?;
//!
//!     let cancel = CancellationToken::new();
//!     let channel = pool.get_ackable_channel(&cancel).await?;
//!     // ... use the channel ...
//!     pool.return_channel(channel, false).await;
//!     Ok(())
//! }
//! ```

mod channel;
mod channel_pool;
mod connection;
mod error;
mod options;

pub use channel::{ChannelHost, RECOVERY_ID_ARGUMENT};
pub use channel_pool::{ChannelPool, ChannelPoolStatus, PoolStatus, PooledChannel};
pub use connection::{ConnectionHost, ConnectionPool};
pub use error::Error;
pub use options::PoolOptions;

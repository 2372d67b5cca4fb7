use crate::helpers::pool_options;
use carrot_conveyor::pool::{ChannelPool, Error, PoolOptions};
use carrot_conveyor::transport::memory::MemoryBroker;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn get_pool(broker: &MemoryBroker, options: PoolOptions) -> ChannelPool {
    ChannelPool::new(Arc::new(broker.clone()), options)
        .await
        .unwrap()
}

#[tokio::test]
async fn ackable_checkouts_are_bounded_by_connections_times_channels() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = Arc::new(
        get_pool(
            &broker,
            PoolOptions {
                connections: 2,
                ackable_channels_per_connection: 2,
                ..pool_options()
            },
        )
        .await,
    );
    let cancel = CancellationToken::new();
    let mut checked_out = Vec::new();
    for _ in 0..4 {
        checked_out.push(pool.get_ackable_channel(&cancel).await.unwrap());
    }

    // Act
    let fifth = tokio::spawn({
        let pool = Arc::clone(&pool);
        let cancel = cancel.clone();
        async move { pool.get_ackable_channel(&cancel).await.map(|c| c.id()) }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Assert
    assert!(!fifth.is_finished());
    assert_eq!(4, pool.in_use(true));
    assert_eq!(0, pool.in_use(false));

    let returned = checked_out.pop().unwrap();
    let returned_id = returned.id();
    pool.return_channel(returned, false).await;
    let fifth = tokio::time::timeout(Duration::from_secs(1), fifth)
        .await
        .expect("The fifth acquisition should go through once a channel is returned")
        .unwrap()
        .unwrap();
    assert_eq!(returned_id, fifth);
}

#[tokio::test]
async fn channels_are_spread_over_connections() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(
        &broker,
        PoolOptions {
            connections: 2,
            channels_per_connection: 2,
            ..pool_options()
        },
    )
    .await;
    let cancel = CancellationToken::new();

    // Act
    let first = pool.get_channel(&cancel).await.unwrap();
    let second = pool.get_channel(&cancel).await.unwrap();

    // Assert
    assert_eq!(2, broker.connections_opened());
    let first_connection = first.connection().unwrap().id();
    let second_connection = second.connection().unwrap().id();
    assert_ne!(first_connection, second_connection);
}

#[tokio::test]
async fn transient_channels_never_enter_the_fixed_pools() {
    // Arrange
    let broker = MemoryBroker::new();
    let options = pool_options();
    let offset = options.transient_channel_id_offset;
    let pool = get_pool(&broker, options).await;
    let cancel = CancellationToken::new();
    let pooled = pool.get_ackable_channel(&cancel).await.unwrap();
    pool.return_channel(pooled, false).await;
    let before = pool.status();

    // Act
    let mut transient = Vec::new();
    for _ in 0..3 {
        transient.push(pool.get_transient_channel(true, &cancel).await.unwrap());
    }
    for channel in &transient {
        channel.close().await.unwrap();
    }

    // Assert
    let after = pool.status();
    assert_eq!(before.ackable, after.ackable);
    assert_eq!(before.plain, after.plain);
    assert_eq!(3, after.transient_created);
    assert!(transient
        .iter()
        .all(|channel| channel.transient() && channel.ackable() && channel.id() >= offset));
}

#[tokio::test]
async fn churning_transient_channels_does_not_accumulate_connection_listeners() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker, pool_options()).await;
    let cancel = CancellationToken::new();
    let pooled = pool.get_ackable_channel(&cancel).await.unwrap();

    // Act
    for _ in 0..1_000 {
        let channel = pool.get_transient_channel(true, &cancel).await.unwrap();
        channel.close().await.unwrap();
    }

    // Assert
    let connection = &pool.connections().hosts()[0];
    // The pooled channel, plus the last transient one until the next subscription.
    assert!(connection.subscribed_listeners() <= 2);
    pool.return_channel(pooled, false).await;
}

#[tokio::test]
async fn a_channel_returned_with_an_error_is_replaced() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(
        &broker,
        PoolOptions {
            ackable_channels_per_connection: 1,
            ..pool_options()
        },
    )
    .await;
    let cancel = CancellationToken::new();
    let channel = pool.get_ackable_channel(&cancel).await.unwrap();
    let broken_id = channel.id();
    let broken = channel.channel();

    // Act
    pool.return_channel(channel, true).await;
    let replacement = pool.get_ackable_channel(&cancel).await.unwrap();

    // Assert
    assert!(!broken.is_open());
    assert_ne!(broken_id, replacement.id());
    assert!(replacement.healthy());
}

#[tokio::test]
async fn a_dropped_connection_is_rebuilt_before_the_channel_is_used_again() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker, pool_options()).await;
    let cancel = CancellationToken::new();
    let channel = pool.get_ackable_channel(&cancel).await.unwrap();
    broker.drop_connections("network failure");
    assert!(!channel.healthy());

    // Act
    pool.wait_until_healthy(&channel, &cancel).await.unwrap();

    // Assert
    assert!(channel.healthy());
    assert_eq!(2, broker.connections_opened());
    assert_eq!(1, broker.open_connections());
}

#[tokio::test]
async fn waiting_for_a_healthy_channel_can_be_cancelled() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker, pool_options()).await;
    let cancel = CancellationToken::new();
    let channel = pool.get_ackable_channel(&cancel).await.unwrap();
    broker.fail_next_connections(usize::MAX);
    broker.drop_connections("network failure");

    // Act
    let waiting = pool.wait_until_healthy(&channel, &cancel);
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    };
    let (outcome, ()) = tokio::join!(waiting, canceller);

    // Assert
    assert!(matches!(outcome, Err(Error::Cancelled)));
    assert!(!channel.healthy());
}

#[tokio::test]
async fn no_channel_is_handed_out_after_shutdown() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_pool(&broker, pool_options()).await;

    // Act
    pool.shutdown().await;

    // Assert
    let outcome = pool.get_channel(&CancellationToken::new()).await;
    assert!(matches!(outcome, Err(Error::Closed)));
    assert_eq!(0, broker.open_connections());
}

use crate::helpers::{
    body, consumer_options, declare_queue, eventually, get_channel_pool, get_consumer,
};
use carrot_conveyor::consumers::{
    Consumer, ConsumerError, ConsumerOptions, ConsumerStatus, QueueFullBehavior,
};
use carrot_conveyor::transport::memory::MemoryBroker;
use fake::{Fake, Faker};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Read until the consumer is stopped and its intake queue is empty, acknowledging everything.
async fn read_and_ack_all(consumer: Consumer) -> Vec<String> {
    let cancel = CancellationToken::new();
    let mut bodies = Vec::new();
    while let Ok(message) = consumer.read(&cancel).await {
        assert!(message.ack().await);
        bodies.push(body(&message));
    }
    bodies
}

#[tokio::test]
async fn deliveries_are_read_in_publication_order() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let consumer = get_consumer(consumer_options(&queue_name, 10), &pool);
    for n in 1..=3 {
        broker.publish(&queue_name, n.to_string());
    }

    // Act
    consumer.start().await.unwrap();
    let cancel = CancellationToken::new();
    let mut bodies = Vec::new();
    for _ in 0..3 {
        let message = consumer.read(&cancel).await.unwrap();
        assert!(message.ackable());
        assert!(message.ack().await);
        bodies.push(body(&message));
    }

    // Assert
    assert_eq!(vec!["1", "2", "3"], bodies);
    assert_eq!(ConsumerStatus::Started, consumer.status());
    assert!(consumer.consumer_tag().is_some());
    assert_eq!(1, pool.in_use(true));
    eventually("every delivery is acknowledged", || broker.acked_count() == 3).await;
    consumer.stop(false).await.unwrap();
    assert_eq!(0, pool.in_use(true));
}

#[tokio::test]
async fn a_delivery_can_only_be_settled_once() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let consumer = get_consumer(consumer_options(&queue_name, 10), &pool);
    let payload: String = Faker.fake();
    broker.publish(&queue_name, payload.clone());
    consumer.start().await.unwrap();
    let message = consumer.read(&CancellationToken::new()).await.unwrap();

    // Act
    let acked = message.ack().await;
    let rejected = message.reject(true).await;

    // Assert
    assert_eq!(payload, body(&message));
    assert!(acked);
    assert!(!rejected);
    assert!(message.settled());
    eventually("the delivery is acknowledged", || broker.acked_count() == 1).await;
    assert_eq!(0, broker.ready_count(&queue_name));
}

#[tokio::test]
async fn the_intake_queue_holds_at_most_a_batch() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let consumer = get_consumer(consumer_options(&queue_name, 3), &pool);
    for n in 1..=10 {
        broker.publish(&queue_name, n.to_string());
    }

    // Act
    consumer.start().await.unwrap();
    eventually("a batch is buffered", || consumer.buffered() == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert
    assert_eq!(3, consumer.buffered());
    assert_eq!(7, broker.ready_count(&queue_name));
}

#[tokio::test]
async fn graceful_stop_hands_every_buffered_delivery_to_readers() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let consumer = get_consumer(consumer_options(&queue_name, 5), &pool);
    for n in 1..=5 {
        broker.publish(&queue_name, n.to_string());
    }
    consumer.start().await.unwrap();
    eventually("every delivery is buffered", || consumer.buffered() == 5).await;

    // Act
    let reader = tokio::spawn(read_and_ack_all(consumer.clone()));
    consumer.stop(false).await.unwrap();

    // Assert
    assert_eq!(0, consumer.buffered());
    assert_eq!(ConsumerStatus::Stopped, consumer.status());
    let bodies = reader.await.unwrap();
    assert_eq!(vec!["1", "2", "3", "4", "5"], bodies);
    eventually("every delivery is acknowledged", || broker.acked_count() == 5).await;
}

#[tokio::test]
async fn immediate_stop_leaves_undelivered_items_unacknowledged() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let consumer = get_consumer(consumer_options(&queue_name, 5), &pool);
    for n in 1..=5 {
        broker.publish(&queue_name, n.to_string());
    }
    consumer.start().await.unwrap();
    eventually("every delivery is buffered", || consumer.buffered() == 5).await;

    // Act
    consumer.stop(true).await.unwrap();

    // Assert
    let outcome = consumer.read(&CancellationToken::new()).await;
    assert!(matches!(outcome, Err(ConsumerError::QueueClosed)));
    assert_eq!(0, broker.acked_count());
    eventually("deliveries go back to the queue", || {
        broker.ready_count(&queue_name) == 5
    })
    .await;
    assert_eq!(0, broker.unacked_count());
}

#[tokio::test]
async fn a_drop_write_consumer_buffers_deliveries_that_fit() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let options = ConsumerOptions {
        behavior_when_full: QueueFullBehavior::DropWrite,
        ..consumer_options(&queue_name, 2)
    };
    let consumer = get_consumer(options, &pool);
    broker.publish(&queue_name, "kept");

    // Act
    consumer.start().await.unwrap();
    eventually("the delivery is buffered", || consumer.buffered() == 1).await;

    // Assert
    let message = consumer.read(&CancellationToken::new()).await.unwrap();
    assert_eq!("kept", body(&message));
    assert_eq!(0, consumer.buffered());
}

#[tokio::test]
async fn read_until_empty_takes_everything_buffered() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let consumer = get_consumer(consumer_options(&queue_name, 4), &pool);
    for n in 1..=4 {
        broker.publish(&queue_name, n.to_string());
    }
    consumer.start().await.unwrap();
    eventually("every delivery is buffered", || consumer.buffered() == 4).await;

    // Act
    let messages = consumer
        .read_until_empty(&CancellationToken::new())
        .await
        .unwrap();

    // Assert
    let bodies: Vec<_> = messages.iter().map(|m| body(m)).collect();
    assert_eq!(vec!["1", "2", "3", "4"], bodies);
}

#[tokio::test]
async fn the_stream_ends_once_the_consumer_is_stopped() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let options = ConsumerOptions {
        auto_ack: true,
        ..consumer_options(&queue_name, 10)
    };
    let consumer = get_consumer(options, &pool);
    for n in 1..=3 {
        broker.publish(&queue_name, n.to_string());
    }
    consumer.start().await.unwrap();
    eventually("every delivery is buffered", || consumer.buffered() == 3).await;

    // Act
    let stream = consumer.stream();
    let collector = tokio::spawn(async move {
        stream
            .map(|message| body(&message))
            .collect::<Vec<_>>()
            .await
    });
    consumer.stop(false).await.unwrap();

    // Assert
    assert_eq!(vec!["1", "2", "3"], collector.await.unwrap());
    assert_eq!(0, pool.in_use(true));
    assert_eq!(0, pool.in_use(false));
}

#[tokio::test]
async fn a_disabled_consumer_does_not_start() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let options = ConsumerOptions {
        enabled: false,
        ..consumer_options(&queue_name, 10)
    };
    let consumer = get_consumer(options, &pool);

    // Act
    consumer.start().await.unwrap();

    // Assert
    assert_eq!(ConsumerStatus::Stopped, consumer.status());
    assert_eq!(0, pool.in_use(true));
}

#[tokio::test]
async fn starting_is_retried_until_the_consumer_is_stopped() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;
    // The queue does not exist: registration keeps failing.
    let consumer = get_consumer(consumer_options("missing", 10), &pool);

    // Act
    let start = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.start().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!start.is_finished());
    consumer.stop(false).await.unwrap();

    // Assert
    let outcome = start.await.unwrap();
    assert!(matches!(outcome, Err(ConsumerError::Cancelled)));
    assert_eq!(ConsumerStatus::Stopped, consumer.status());
    assert_eq!(0, pool.in_use(true));
}

#[tokio::test]
async fn a_stop_requested_while_a_start_waits_for_its_turn_cancels_that_start() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let consumer = get_consumer(consumer_options(&queue_name, 10), &pool);
    broker.publish(&queue_name, "1");
    consumer.start().await.unwrap();
    eventually("the delivery is buffered", || consumer.buffered() == 1).await;
    // A graceful stop holds on until the buffered delivery is read.
    let first_stop = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.stop(false).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let start = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.start().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Act
    let second_stop = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.stop(false).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let message = consumer.read(&CancellationToken::new()).await.unwrap();
    assert!(message.ack().await);

    // Assert
    let within = |task| tokio::time::timeout(Duration::from_secs(1), task);
    within(first_stop).await.unwrap().unwrap().unwrap();
    let outcome = within(start).await.unwrap().unwrap();
    assert!(matches!(outcome, Err(ConsumerError::Cancelled)));
    within(second_stop).await.unwrap().unwrap().unwrap();
    assert_eq!(ConsumerStatus::Stopped, consumer.status());

    consumer.start().await.unwrap();
    assert_eq!(ConsumerStatus::Started, consumer.status());
    consumer.stop(true).await.unwrap();
}

#[tokio::test]
async fn a_stream_taken_before_starting_follows_the_consumer() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let options = ConsumerOptions {
        auto_ack: true,
        ..consumer_options(&queue_name, 10)
    };
    let consumer = get_consumer(options, &pool);
    let stream = consumer.stream();
    for n in 1..=2 {
        broker.publish(&queue_name, n.to_string());
    }

    // Act
    consumer.start().await.unwrap();
    eventually("every delivery is buffered", || consumer.buffered() == 2).await;
    let collector = tokio::spawn(async move {
        stream
            .map(|message| body(&message))
            .collect::<Vec<_>>()
            .await
    });
    consumer.stop(false).await.unwrap();

    // Assert
    assert_eq!(vec!["1", "2"], collector.await.unwrap());
}

#[tokio::test]
async fn invalid_options_are_rejected() {
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;

    let outcome = Consumer::new("test", consumer_options("", 10), Arc::clone(&pool));

    assert!(matches!(outcome, Err(ConsumerError::Configuration(_))));
}

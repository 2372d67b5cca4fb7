use crate::helpers::{body, consumer_options, declare_queue, eventually, get_channel_pool, get_consumer};
use carrot_conveyor::pool::RECOVERY_ID_ARGUMENT;
use carrot_conveyor::transport::memory::MemoryBroker;
use carrot_conveyor::transport::{Delivery, DeliveryHandler, ShutdownReason};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Acknowledges deliveries, recording the consumer tag they were attributed to.
#[derive(Default)]
struct TagRecorder {
    tags: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl DeliveryHandler for TagRecorder {
    async fn on_delivery(&self, delivery: Delivery) {
        delivery.acker.ack().await.unwrap();
        self.tags.lock().unwrap().push(delivery.consumer_tag);
    }

    fn on_shutdown(&self, _reason: ShutdownReason) {}
}

#[tokio::test]
async fn the_post_recovery_consumer_tag_is_tracked_by_the_channel_host() {
    // Arrange
    let broker = MemoryBroker::recoverable();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let channel = pool
        .get_ackable_channel(&CancellationToken::new())
        .await
        .unwrap();
    let recovery_id = channel.recovery_id().unwrap().to_owned();
    let arguments = channel.consume_arguments();
    assert_eq!(Some(&recovery_id), arguments.get(RECOVERY_ID_ARGUMENT));

    let recorder = Arc::new(TagRecorder::default());
    let before = channel
        .channel()
        .basic_consume(&queue_name, "before", false, arguments, recorder.clone())
        .await
        .unwrap();
    broker.publish(&queue_name, "first");
    eventually("the first delivery is acknowledged", || {
        broker.acked_count() == 1
    })
    .await;

    // Act
    broker.drop_connections("network failure");
    assert!(!channel.healthy());
    broker.recover_connections();
    broker.publish(&queue_name, "second");

    // Assert
    assert!(channel.healthy());
    assert_eq!(Some(before.clone()), channel.recovering_consumer_tag());
    let after = channel.recovered_consumer_tag().unwrap();
    assert_ne!(before, after);
    eventually("the second delivery is acknowledged", || {
        broker.acked_count() == 2
    })
    .await;
    assert_eq!(vec![before, after], *recorder.tags.lock().unwrap());
}

#[tokio::test]
async fn consumers_without_the_recovery_id_are_not_attributed_to_the_channel() {
    // Arrange
    let broker = MemoryBroker::recoverable();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let channel = pool
        .get_ackable_channel(&CancellationToken::new())
        .await
        .unwrap();
    channel
        .channel()
        .basic_consume(
            &queue_name,
            "anonymous",
            false,
            Default::default(),
            Arc::new(TagRecorder::default()),
        )
        .await
        .unwrap();

    // Act
    broker.drop_connections("network failure");
    broker.recover_connections();

    // Assert
    assert!(channel.healthy());
    assert_eq!(None, channel.recovering_consumer_tag());
    assert_eq!(None, channel.recovered_consumer_tag());
}

#[tokio::test]
async fn a_consumer_picks_up_its_new_tag_after_a_recovery() {
    // Arrange
    let broker = MemoryBroker::recoverable();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let consumer = get_consumer(consumer_options(&queue_name, 10), &pool);
    let cancel = CancellationToken::new();
    consumer.start().await.unwrap();
    let before = consumer.consumer_tag().unwrap();
    for n in 1..=2 {
        broker.publish(&queue_name, n.to_string());
    }
    let mut bodies = Vec::new();
    for _ in 0..2 {
        let message = consumer.read(&cancel).await.unwrap();
        assert!(message.ack().await);
        bodies.push(body(&message));
    }
    eventually("the first deliveries are acknowledged", || {
        broker.acked_count() == 2
    })
    .await;

    // Act
    broker.drop_connections("network failure");
    broker.recover_connections();
    eventually("the consumer adopts its new tag", || {
        consumer.consumer_tag().as_deref() != Some(before.as_str())
    })
    .await;
    for n in 3..=4 {
        broker.publish(&queue_name, n.to_string());
    }
    for _ in 0..2 {
        let message = consumer.read(&cancel).await.unwrap();
        assert!(!message.redelivered());
        assert!(message.ack().await);
        bodies.push(body(&message));
    }

    // Assert
    assert_eq!(vec!["1", "2", "3", "4"], bodies);
    let after = consumer.consumer_tag().unwrap();
    assert!(after.starts_with(&before));
    eventually("every delivery is acknowledged once", || {
        broker.acked_count() == 4
    })
    .await;
    assert_eq!(0, broker.ready_count(&queue_name));
    assert_eq!(1, broker.connections_opened());
}

#[tokio::test]
async fn a_consumer_resumes_once_its_connection_is_rebuilt() {
    // Arrange
    let broker = MemoryBroker::new();
    let pool = get_channel_pool(&broker).await;
    let queue_name = declare_queue(&broker);
    let consumer = get_consumer(consumer_options(&queue_name, 10), &pool);
    let cancel = CancellationToken::new();
    consumer.start().await.unwrap();
    let before = consumer.consumer_tag().unwrap();

    // Act
    broker.drop_connections("network failure");
    eventually("the consumer registers again", || {
        consumer.consumer_tag().as_deref() != Some(before.as_str())
    })
    .await;
    broker.publish(&queue_name, "after the rebuild");

    // Assert
    let message = consumer.read(&cancel).await.unwrap();
    assert_eq!("after the rebuild", body(&message));
    assert!(message.ack().await);
    assert_eq!(2, broker.connections_opened());
    consumer.stop(false).await.unwrap();
}

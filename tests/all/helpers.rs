use carrot_conveyor::consumers::{Consumer, ConsumerOptions, ReceivedMessage};
use carrot_conveyor::pool::{ChannelPool, PoolOptions};
use carrot_conveyor::transport::memory::MemoryBroker;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub fn pool_options() -> PoolOptions {
    PoolOptions {
        connections: 1,
        channels_per_connection: 2,
        ackable_channels_per_connection: 2,
        sleep_on_error_millis: 10,
        recovery_window_millis: 2_000,
        ..PoolOptions::default()
    }
}

pub async fn get_channel_pool(broker: &MemoryBroker) -> Arc<ChannelPool> {
    Arc::new(
        ChannelPool::new(Arc::new(broker.clone()), pool_options())
            .await
            .unwrap(),
    )
}

/// A fresh queue, declared on `broker`.
pub fn declare_queue(broker: &MemoryBroker) -> String {
    let queue_name = Uuid::new_v4().to_string();
    broker.declare_queue(&queue_name);
    queue_name
}

pub fn consumer_options(queue_name: &str, batch_size: u16) -> ConsumerOptions {
    ConsumerOptions {
        batch_size,
        ..ConsumerOptions::new(queue_name)
    }
}

pub fn get_consumer(options: ConsumerOptions, pool: &Arc<ChannelPool>) -> Consumer {
    Consumer::new("test-consumer", options, Arc::clone(pool)).unwrap()
}

pub fn body(message: &ReceivedMessage) -> String {
    String::from_utf8_lossy(message.body()).into_owned()
}

/// Wait for `condition` to hold, failing the test after a few seconds.
pub async fn eventually(description: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for: {description}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

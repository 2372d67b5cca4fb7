//! Facilities to consume messages from a RabbitMq queue. Check out [`Consumer`] as a starting
//! point, and [`ConsumerPipeline`] to process deliveries with a [`Pipeline`](crate::pipeline::Pipeline).
pub use consumer::{Consumer, ConsumerStatus};
pub use consumer_pipeline::{ConsumerPipeline, FeedMode};
pub use error::ConsumerError;
pub use options::{ConsumerOptions, PipelineSettings, QueueFullBehavior};
pub use received::ReceivedMessage;

mod consumer;
mod consumer_pipeline;
mod error;
mod intake;
mod options;
mod received;

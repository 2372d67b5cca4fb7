use crate::configuration::ConfigurationError;
use crate::pipeline::PipelineOptions;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::time::Duration;

/// What the delivery callback does when the intake queue of a consumer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullBehavior {
    /// Wait for room in the queue. The broker stops pushing once the prefetch window is
    /// exhausted, which propagates backpressure upstream.
    #[default]
    Wait,
    /// Drop the delivery. It stays unacknowledged and the broker redelivers it once its channel
    /// goes away.
    DropWrite,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
/// Configuration of a single consumer.
///
/// Intake is always asynchronous: deliveries are written to the intake queue by an awaited
/// callback, one at a time and in broker order, so `Wait` holds the callback until there is room.
pub struct ConsumerOptions {
    /// A disabled consumer never starts.
    pub enabled: bool,
    /// The queue to consume from. It must exist already.
    pub queue_name: String,
    /// Prefetch count of the consumer, which is also the capacity of its intake queue.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub batch_size: u16,
    /// Let the broker consider deliveries acknowledged as soon as they are pushed.
    pub auto_ack: bool,
    pub behavior_when_full: QueueFullBehavior,
    /// Where the processing pipeline sends its output, if anywhere.
    pub target_queue_name: Option<String>,
    /// Where the processing pipeline sends failed messages, if anywhere.
    pub error_queue_name: Option<String>,
    pub consumer_pipeline: PipelineSettings,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_name: String::new(),
            batch_size: 10,
            auto_ack: false,
            behavior_when_full: QueueFullBehavior::default(),
            target_queue_name: None,
            error_queue_name: None,
            consumer_pipeline: PipelineSettings::default(),
        }
    }
}

impl ConsumerOptions {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.queue_name.is_empty() {
            return Err(ConfigurationError::invalid("queue_name", "must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(ConfigurationError::invalid("batch_size", "must be positive"));
        }
        self.consumer_pipeline.validate()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
/// Shape of the pipeline fed by a consumer.
pub struct PipelineSettings {
    /// How many items each step processes concurrently.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub parallelism: usize,
    /// Whether steps emit their outputs in submission order.
    pub ensure_ordered: bool,
    /// Capacity of the buffer in front of each step.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub buffer_size: usize,
    /// Hold the next message back until the previous one has been through the whole pipeline.
    pub wait_for_completion: bool,
    /// Interval between two health checks of the pipeline, in milliseconds.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub health_check_interval_millis: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            parallelism: 4,
            ensure_ordered: true,
            buffer_size: 100,
            wait_for_completion: false,
            health_check_interval_millis: 10_000,
        }
    }
}

impl PipelineSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_millis)
    }

    /// Pipeline options matching these settings.
    pub fn pipeline_options(&self, name: impl Into<String>) -> PipelineOptions {
        PipelineOptions {
            name: name.into(),
            parallelism: self.parallelism,
            ensure_ordered: self.ensure_ordered,
            buffer_size: self.buffer_size,
            health_check_interval: self.health_check_interval(),
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.parallelism == 0 {
            return Err(ConfigurationError::invalid(
                "consumer_pipeline.parallelism",
                "must be positive",
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigurationError::invalid(
                "consumer_pipeline.buffer_size",
                "must be positive",
            ));
        }
        Ok(())
    }
}

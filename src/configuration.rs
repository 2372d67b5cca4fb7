//! The aggregate configuration of a service built on this crate.
//!
//! Settings are plain `serde` structs: load them with the configuration library of your choice
//! and hand them over before startup. Nothing is reloaded at runtime.
use crate::amqp::configuration::RabbitMqSettings;
use crate::consumers::ConsumerOptions;
use crate::pool::PoolOptions;
use serde::Deserialize;
use std::collections::HashMap;

/// Errors raised while validating configuration. They are not recoverable.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("No consumer options were provided for the consumer named `{0}`")]
    MissingConsumerOptions(String),
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigurationError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RuntimeSettings {
    pub rabbit_mq: RabbitMqSettings,
    pub pool: PoolOptions,
    /// Consumer options, keyed by consumer name.
    pub consumers: HashMap<String, ConsumerOptions>,
}

impl RuntimeSettings {
    /// Options of the consumer named `name`.
    pub fn consumer_options(&self, name: &str) -> Result<&ConsumerOptions, ConfigurationError> {
        self.consumers
            .get(name)
            .ok_or_else(|| ConfigurationError::MissingConsumerOptions(name.to_owned()))
    }

    /// Check every section, failing on the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.rabbit_mq.validate()?;
        self.pool.validate()?;
        for (name, options) in &self.consumers {
            options.validate().map_err(|e| match e {
                ConfigurationError::Invalid { field, reason } => {
                    ConfigurationError::invalid(format!("consumers.{name}.{field}"), reason)
                }
                e => e,
            })?;
        }
        Ok(())
    }
}

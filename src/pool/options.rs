use crate::configuration::ConfigurationError;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
/// Sizing and retry behaviour of the connection and channel pools.
pub struct PoolOptions {
    /// Prefix of the connection names reported to the broker, suffixed with the connection id.
    pub connection_name: String,
    /// Number of connections opened to the broker.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub connections: usize,
    /// Number of non-ackable channels pooled for each connection.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub channels_per_connection: usize,
    /// Number of ackable channels pooled for each connection.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub ackable_channels_per_connection: usize,
    /// Pause between two attempts at rebuilding an unhealthy connection or channel,
    /// in milliseconds.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub sleep_on_error_millis: u64,
    /// How long the broker client is given to recover a dropped connection on its own before
    /// the pool rebuilds it, in milliseconds.
    ///
    /// Only relevant for connections that recover on their own.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub recovery_window_millis: u64,
    /// First id handed out to transient channels, keeping them apart from pooled channel ids.
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub transient_channel_id_offset: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connection_name: "carrot-conveyor".into(),
            connections: 2,
            channels_per_connection: 10,
            ackable_channels_per_connection: 10,
            sleep_on_error_millis: 1_000,
            recovery_window_millis: 5_000,
            transient_channel_id_offset: 10_000,
        }
    }
}

impl PoolOptions {
    pub fn sleep_on_error(&self) -> Duration {
        Duration::from_millis(self.sleep_on_error_millis)
    }

    pub fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.recovery_window_millis)
    }

    /// Upper bound on the number of pooled channels of a kind.
    pub fn max_channels(&self, ackable: bool) -> usize {
        let per_connection = if ackable {
            self.ackable_channels_per_connection
        } else {
            self.channels_per_connection
        };
        self.connections * per_connection
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.connections == 0 {
            return Err(ConfigurationError::invalid(
                "pool.connections",
                "at least one connection is required",
            ));
        }
        if self.channels_per_connection == 0 && self.ackable_channels_per_connection == 0 {
            return Err(ConfigurationError::invalid(
                "pool.channels_per_connection",
                "at least one kind of channel must be pooled",
            ));
        }
        Ok(())
    }
}

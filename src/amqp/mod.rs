//! RabbitMq connectivity on top of `lapin`: settings, connection factory and property helpers.

pub mod configuration;
pub mod convenience;
mod factory;

pub use factory::ConnectionFactory;
pub use lapin::BasicProperties;

//! `carrot-conveyor` is a resilient RabbitMQ client runtime, built on top of
//! [`lapin`](https://crates.io/crates/lapin).
//!
//! It keeps a fixed set of connections and channels healthy across broker restarts and network
//! drops ([`pool`]), pulls deliveries into bounded intake queues ([`consumers::Consumer`]) and
//! runs them through typed, concurrent processing chains ([`pipeline::Pipeline`],
//! [`consumers::ConsumerPipeline`]).
//!
//! The broker is reached through the traits of the [`transport`] module: use
//! [`amqp::ConnectionFactory`] for RabbitMq, or [`transport::memory::MemoryBroker`] in tests.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.

pub mod amqp;
pub mod configuration;
pub mod consumers;
pub mod pipeline;
pub mod pool;
pub mod transport;

mod sync;

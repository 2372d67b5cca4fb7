//! Implements the broker boundary on top of [`lapin`]'s [`Connection`](lapin::Connection) and
//! [`Channel`](lapin::Channel).
//!
//! `lapin` does not re-establish dropped connections, therefore [`RabbitMqConnection`] does not
//! expose recovery notifications: pools rebuild it once it is found closed.
use super::{
    Acker, BrokerChannel, BrokerConnection, ConsumeArguments, Delivery, DeliveryHandler,
    MessageProperties, ShutdownReason, TransportError,
};
use crate::amqp::convenience::{to_basic_properties, BasicPropertiesExt};
use amq_protocol_types::{AMQPValue, FieldTable};
use futures_util::{Stream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
    },
};
use std::sync::Arc;

/// A connection to a RabbitMq broker.
pub struct RabbitMqConnection(lapin::Connection);

impl RabbitMqConnection {
    pub fn new(connection: lapin::Connection) -> Self {
        Self(connection)
    }

    /// Escape hatch: access the underlying `lapin` connection.
    pub fn raw(&self) -> &lapin::Connection {
        &self.0
    }
}

#[async_trait::async_trait]
impl BrokerConnection for RabbitMqConnection {
    fn is_open(&self) -> bool {
        self.0.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self.0.create_channel().await?;
        Ok(Arc::new(RabbitMqChannel(channel)))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }
        self.0.close(200, "Connection closed by client").await?;
        Ok(())
    }
}

/// A RabbitMq channel.
pub struct RabbitMqChannel(lapin::Channel);

impl RabbitMqChannel {
    /// Escape hatch: access the underlying `lapin` channel.
    pub fn raw(&self) -> &lapin::Channel {
        &self.0
    }
}

#[async_trait::async_trait]
impl BrokerChannel for RabbitMqChannel {
    fn channel_number(&self) -> u16 {
        self.0.id()
    }

    fn is_open(&self) -> bool {
        self.0.status().connected()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), TransportError> {
        self.0
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
        arguments: ConsumeArguments,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, TransportError> {
        let mut table = FieldTable::default();
        for (key, value) in arguments {
            table.insert(key.into(), AMQPValue::LongString(value.into()));
        }
        let consumer = self
            .0
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                table,
            )
            .await?;
        let tag = consumer.tag().as_str().to_owned();

        let consumer_tag = tag.clone();
        let deliveries = consumer.map(move |delivery| {
            delivery.map(|delivery| from_lapin_delivery(delivery, consumer_tag.clone()))
        });
        tokio::spawn(drive_deliveries(deliveries, handler));
        Ok(tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.0
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        self.0
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(&properties),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }
        self.0.close(200, "Channel closed by client").await?;
        Ok(())
    }
}

struct RabbitMqAcker(lapin::acker::Acker);

#[async_trait::async_trait]
impl Acker for RabbitMqAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), TransportError> {
        self.0.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

/// Hand deliveries over to `handler` one at a time, in the order the broker sent them.
async fn drive_deliveries<S>(deliveries: S, handler: Arc<dyn DeliveryHandler>)
where
    S: Stream<Item = Result<Delivery, lapin::Error>>,
{
    futures_util::pin_mut!(deliveries);
    while let Some(delivery) = deliveries.next().await {
        match delivery {
            Ok(delivery) => handler.on_delivery(delivery).await,
            Err(e) => {
                handler.on_shutdown(ShutdownReason::ChannelClosed(e.to_string()));
                return;
            }
        }
    }
    handler.on_shutdown(ShutdownReason::Cancelled);
}

fn from_lapin_delivery(delivery: lapin::message::Delivery, consumer_tag: String) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        consumer_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        properties: delivery.properties.to_message_properties(),
        body: delivery.data,
        acker: Arc::new(RabbitMqAcker(delivery.acker)),
    }
}

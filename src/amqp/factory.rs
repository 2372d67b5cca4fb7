use crate::amqp::configuration::RabbitMqSettings;
use crate::transport::{
    rabbit_mq::RabbitMqConnection, BrokerConnection, TransportError, TransportFactory,
};
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;

/// Opens `lapin` connections to the broker described by a [`RabbitMqSettings`].
///
/// This is the [`TransportFactory`] to hand over to a [`ConnectionPool`](crate::pool::ConnectionPool)
/// in production.
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    connection_timeout: Duration,
    tls: Option<Arc<Tls>>,
}

struct Tls {
    connector: NativeTlsConnector,
    domain: String,
}

impl ConnectionFactory {
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = match (&settings.tls, settings.tls_domain()) {
            (Some(tls_settings), Some(domain)) => {
                let mut builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    builder.add_root_certificate(certificate);
                }
                let connector = builder
                    .build()
                    .context("Failed to build the TLS connector for RabbitMq")?;
                Some(Arc::new(Tls { connector, domain }))
            }
            _ => None,
        };
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout: settings.connection_timeout(),
            tls,
        })
    }

    /// Open a connection named `connection_name`, as shown in the RabbitMq management UI.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn connect(&self, connection_name: &str) -> Result<lapin::Connection, anyhow::Error> {
        let properties = ConnectionProperties::default()
            .with_connection_name(connection_name.to_owned().into())
            .with_executor(tokio_executor_trait::Tokio::current());
        let connect = async {
            match &self.tls {
                None => lapin::Connection::connect_uri(self.uri.clone(), properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        };
        let connection = tokio::time::timeout(self.connection_timeout, connect)
            .await
            .context("Timed out while connecting to RabbitMq")??;
        let name = connection_name.to_owned();
        connection.on_error(move |e| {
            tracing::warn!(connection = %name, error = ?e, "RabbitMq connection broke");
        });
        Ok(connection)
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain TCP first, then the handshake against the expected domain.
                let mut uri = uri.clone();
                uri.scheme = AMQPScheme::AMQP;
                uri.connect()
                    .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain))
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl TransportFactory for ConnectionFactory {
    async fn new_connection(
        &self,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let connection = self.connect(connection_name).await?;
        Ok(Arc::new(RabbitMqConnection::new(connection)))
    }
}

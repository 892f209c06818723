use crate::amqp::broker::{BrokerConnection, BrokerError, ConnectionProvider};
use crate::amqp::configuration::BrokerSettings;
use crate::amqp::lapin_broker::LapinConnection;
use lapin::tcp::{AMQPUriTcpExt, NativeTlsConnector};
use lapin::uri::{AMQPScheme, AMQPUri};
use lapin::{Connection, ConnectionProperties};
use std::sync::Arc;
use std::time::Duration;

/// Opens `lapin` connections to the broker described by [`BrokerSettings`].
///
/// Each call to [`ConnectionProvider::connect`] opens a brand new connection, so every
/// consumer owns its own. Wrap the factory in a
/// [`SharedConnection`](crate::amqp::SharedConnection) to share one.
#[derive(Clone)]
pub struct ConnectionFactory {
    uri: AMQPUri,
    connect_timeout: Duration,
    connection_name: Option<String>,
    tls: Option<Arc<TlsTarget>>,
}

struct TlsTarget {
    connector: NativeTlsConnector,
    domain: String,
}

impl ConnectionFactory {
    /// Fails if the TLS settings cannot be turned into a connector.
    pub fn new(settings: &BrokerSettings) -> Result<Self, anyhow::Error> {
        let tls = match (&settings.tls, settings.tls_domain()) {
            (Some(tls), Some(domain)) => Some(Arc::new(TlsTarget {
                connector: tls.connector()?,
                domain: domain.to_owned(),
            })),
            _ => None,
        };
        Ok(Self {
            uri: settings.amqp_uri(),
            connect_timeout: settings.connect_timeout(),
            connection_name: settings.connection_name.clone(),
            tls,
        })
    }

    /// Encrypt connections with `connector`, expecting a certificate issued for `domain`.
    pub fn with_tls(mut self, connector: NativeTlsConnector, domain: impl Into<String>) -> Self {
        self.tls = Some(Arc::new(TlsTarget {
            connector,
            domain: domain.into(),
        }));
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.tls.is_some()
    }

    fn properties(&self) -> ConnectionProperties {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }

    /// Opens a raw `lapin` connection, giving up after the configured timeout.
    #[tracing::instrument(
        name = "broker_connect",
        skip(self),
        fields(host = %self.uri.authority.host, encrypted = self.is_encrypted())
    )]
    pub async fn open(&self) -> Result<Connection, BrokerError> {
        let properties = self.properties();
        let connecting = async {
            match self.tls.clone() {
                Some(tls) => connect_encrypted(self.uri.clone(), properties, tls).await,
                None => Connection::connect_uri(self.uri.clone(), properties).await,
            }
        };
        match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(connection) => Ok(connection?),
            Err(_) => {
                tracing::error!(
                    timeout = ?self.connect_timeout,
                    "Timed out connecting to the broker"
                );
                Err(BrokerError::Timeout)
            }
        }
    }
}

// The TLS handshake runs over a plain AMQP TCP stream so the expected certificate
// domain can differ from the host we dial.
async fn connect_encrypted(
    uri: AMQPUri,
    properties: ConnectionProperties,
    tls: Arc<TlsTarget>,
) -> Result<Connection, lapin::Error> {
    let dial = move |uri: &AMQPUri| {
        let mut plain = uri.clone();
        plain.scheme = AMQPScheme::AMQP;
        plain
            .connect()
            .and_then(|stream| stream.into_native_tls(&tls.connector, &tls.domain))
    };
    Connection::connector(uri, Box::new(dial), properties).await
}

#[async_trait::async_trait]
impl ConnectionProvider for ConnectionFactory {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = self.open().await?;
        Ok(Arc::new(LapinConnection::new(connection)))
    }
}

use crate::amqp::broker::{BrokerConnection, BrokerError, ConnectionProvider};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A [`ConnectionProvider`] that opens one connection and hands it to every caller.
///
/// Consumers built from the same `SharedConnection` detect that the connection is shared
/// and leave closing it to whoever owns the provider. A connection that went away is
/// replaced on the next call.
pub struct SharedConnection<P> {
    inner: P,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
}

impl<P: ConnectionProvider> SharedConnection<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            connection: Mutex::new(None),
        }
    }

    /// Close the shared connection, if one was opened.
    pub async fn close(&self) -> Result<(), BrokerError> {
        match self.connection.lock().await.take() {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl<P: ConnectionProvider> ConnectionProvider for SharedConnection<P> {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref().filter(|c| c.is_open()) {
            return Ok(connection.clone());
        }
        let connection = self.inner.connect().await?;
        *slot = Some(connection.clone());
        Ok(connection)
    }
}

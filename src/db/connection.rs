//! Physical connection seam and the PostgreSQL implementation.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Executor, PgConnection};

use crate::config::DatabaseConfig;
use crate::error::InfraError;

/// One physical database connection.
///
/// Statements are issued by callers directly on the concrete type; the
/// pool only needs liveness and transaction control.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Cheap liveness probe.
    async fn ping(&mut self) -> Result<(), InfraError>;

    /// Starts a transaction.
    async fn begin(&mut self) -> Result<(), InfraError>;

    /// Commits the current transaction.
    async fn commit(&mut self) -> Result<(), InfraError>;

    /// Rolls back the current transaction.
    async fn rollback(&mut self) -> Result<(), InfraError>;

    /// Gracefully closes the connection.
    async fn close(self) -> Result<(), InfraError>
    where
        Self: Sized;
}

/// Opens new physical connections for a pool.
#[async_trait]
pub trait Connector: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Connection type produced by this connector.
    type Connection: Connection;

    /// Opens a new connection.
    async fn connect(&self) -> Result<Self::Connection, InfraError>;
}

/// Opens `sqlx` PostgreSQL connections.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    connect_timeout: Duration,
}

impl PgConnector {
    /// Builds connect options from the database settings. Performs no I/O.
    #[must_use]
    pub fn new(config: &DatabaseConfig, connect_timeout: Duration) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database)
            .application_name(env!("CARGO_PKG_NAME"));
        Self {
            options,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection, InfraError> {
        match tokio::time::timeout(self.connect_timeout, self.options.connect()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(InfraError::Connectivity(e.to_string())),
            Err(_) => Err(InfraError::Connectivity(format!(
                "connect timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn ping(&mut self) -> Result<(), InfraError> {
        sqlx::Connection::ping(self)
            .await
            .map_err(|e| InfraError::Connectivity(e.to_string()))
    }

    async fn begin(&mut self) -> Result<(), InfraError> {
        (&mut *self)
            .execute("BEGIN")
            .await
            .map_err(|e| InfraError::Transaction(format!("begin failed: {e}")))?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), InfraError> {
        (&mut *self)
            .execute("COMMIT")
            .await
            .map_err(|e| InfraError::Transaction(format!("commit failed: {e}")))?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), InfraError> {
        (&mut *self)
            .execute("ROLLBACK")
            .await
            .map_err(|e| InfraError::Transaction(format!("rollback failed: {e}")))?;
        Ok(())
    }

    async fn close(self) -> Result<(), InfraError> {
        sqlx::Connection::close(self)
            .await
            .map_err(|e| InfraError::Connectivity(e.to_string()))
    }
}

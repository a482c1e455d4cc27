//! Redis-list transport.
//!
//! Each category is a list under `"{prefix}:{category}"`. Producers
//! `LPUSH`; the consumer `BRPOP`s the oldest item and then `RPOP`s the
//! rest of the batch. Requeued items are `RPUSH`ed back onto the consumer
//! end. Blocking pops use their own multiplexed connection so they never
//! hold up producers.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;

use super::LogTransport;
use crate::config::RedisConfig;
use crate::error::InfraError;
use crate::logging::record::Category;

/// Upper bound on a single blocking pop, kept below the response timeout
/// of the consumer connection.
const MAX_BLOCK: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings shared by the transport and the lease store.
pub(crate) fn connection_config(response_timeout: Duration) -> redis::AsyncConnectionConfig {
    redis::AsyncConnectionConfig::new()
        .set_connection_timeout(CONNECT_TIMEOUT)
        .set_response_timeout(response_timeout)
}

/// Transport backed by Redis lists.
#[derive(Clone)]
pub struct RedisTransport {
    producer: MultiplexedConnection,
    consumer: MultiplexedConnection,
    prefix: String,
}

impl std::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisTransport {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Connectivity`] if the server cannot be
    /// reached.
    pub async fn connect(config: &RedisConfig, prefix: impl Into<String>) -> Result<Self, InfraError> {
        let client = redis::Client::open(config.connection_info())
            .map_err(|e| InfraError::Connectivity(format!("invalid redis settings: {e}")))?;
        let producer = client
            .get_multiplexed_async_connection_with_config(&connection_config(Duration::from_secs(5)))
            .await
            .map_err(|e| InfraError::Connectivity(format!("redis connect failed: {e}")))?;
        let consumer = client
            .get_multiplexed_async_connection_with_config(&connection_config(
                MAX_BLOCK + Duration::from_secs(5),
            ))
            .await
            .map_err(|e| InfraError::Connectivity(format!("redis connect failed: {e}")))?;
        tracing::info!(host = %config.host, port = config.port, "connected log transport to redis");
        Ok(Self {
            producer,
            consumer,
            prefix: prefix.into(),
        })
    }

    fn key(&self, category: Category) -> String {
        format!("{}:{}", self.prefix, category.as_str())
    }
}

#[async_trait]
impl LogTransport for RedisTransport {
    async fn push(&self, category: Category, payload: String) -> Result<(), InfraError> {
        let mut con = self.producer.clone();
        let _len: i64 = redis::cmd("LPUSH")
            .arg(self.key(category))
            .arg(payload)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn pop_batch(
        &self,
        category: Category,
        max_items: usize,
        timeout: Duration,
    ) -> Result<Vec<String>, InfraError> {
        let key = self.key(category);
        let mut con = self.consumer.clone();
        let block = timeout.min(MAX_BLOCK).as_secs_f64().max(0.01);

        let first: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&key)
            .arg(block)
            .query_async(&mut con)
            .await?;
        let Some((_, first)) = first else {
            return Ok(Vec::new());
        };

        let mut batch = vec![first];
        let rest = max_items.saturating_sub(1);
        if rest > 0 {
            let more: Option<Vec<String>> = redis::cmd("RPOP")
                .arg(&key)
                .arg(rest)
                .query_async(&mut con)
                .await?;
            batch.extend(more.unwrap_or_default());
        }
        Ok(batch)
    }

    async fn requeue(&self, category: Category, items: Vec<String>) -> Result<(), InfraError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut con = self.producer.clone();
        let reversed: Vec<String> = items.into_iter().rev().collect();
        let _len: i64 = redis::cmd("RPUSH")
            .arg(self.key(category))
            .arg(reversed)
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), InfraError> {
        let mut con = self.producer.clone();
        let _pong: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }
}

//! Bounded connection pool with overflow, recycling and pre-ping.
//!
//! Capacity is enforced by a [`Semaphore`] holding
//! `max_connections + max_overflow` permits; a checked-out
//! [`PooledConnection`] owns one permit until it is returned. Idle
//! connections wait in a `VecDeque`, at most `max_connections` of them.
//! Connections returned beyond that are overflow and get closed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use super::Role;
use super::connection::{Connection, Connector};
use crate::config::PoolConfig;
use crate::error::InfraError;

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections waiting in the idle set.
    pub idle: usize,
    /// Connections currently checked out.
    pub in_use: usize,
    /// `max_connections + max_overflow`.
    pub capacity: usize,
}

struct IdleConnection<T> {
    conn: T,
    created_at: Instant,
}

struct PoolInner<C: Connector> {
    role: Role,
    config: PoolConfig,
    connector: C,
    idle: Mutex<VecDeque<IdleConnection<C::Connection>>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl<C: Connector> PoolInner<C> {
    /// Puts a healthy connection back, or closes it if the pool is closed
    /// or the idle set is already full (overflow).
    fn checkin(&self, conn: C::Connection, created_at: Instant) {
        if self.closed.load(Ordering::Acquire) {
            spawn_close::<C>(conn);
            return;
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let limit = usize::try_from(self.config.max_connections).unwrap_or(usize::MAX);
        if idle.len() >= limit {
            drop(idle);
            tracing::debug!(role = %self.role, "closing overflow connection");
            spawn_close::<C>(conn);
            return;
        }
        idle.push_back(IdleConnection { conn, created_at });
    }

    fn take_idle(&self) -> Option<IdleConnection<C::Connection>> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_back()
    }
}

/// Closes a connection in the background when a runtime is available;
/// otherwise dropping it tears the socket down.
fn spawn_close<C: Connector>(conn: C::Connection) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "error while closing connection");
            }
        });
    }
}

/// Connection pool for one role.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("role", &self.inner.role)
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Creates an empty pool. Opens no connections.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Config`] if the pool configuration is invalid.
    pub fn new(role: Role, config: PoolConfig, connector: C) -> Result<Self, InfraError> {
        config.validate()?;
        let permits = Arc::new(Semaphore::new(config.capacity()));
        Ok(Self {
            inner: Arc::new(PoolInner {
                role,
                config,
                connector,
                idle: Mutex::new(VecDeque::new()),
                permits,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Role this pool serves.
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Connector used to open new connections.
    #[must_use]
    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Returns a snapshot of idle and checked-out counts.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let capacity = self.inner.config.capacity();
        let idle = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        PoolStatus {
            idle,
            in_use: capacity.saturating_sub(self.inner.permits.available_permits()),
            capacity,
        }
    }

    /// Checks out a connection.
    ///
    /// Waits up to `connect_timeout_s` for capacity. Idle connections past
    /// `recycle_after_s` are closed and replaced; with `pre_ping` enabled
    /// an idle connection that fails its probe is discarded and replaced.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::PoolExhausted`] if no capacity frees up in
    /// time, or [`InfraError::Connectivity`] if the pool is closed or a
    /// new connection cannot be opened.
    pub async fn acquire(&self) -> Result<PooledConnection<C>, InfraError> {
        let timeout = self.inner.config.connect_timeout();
        let started = Instant::now();
        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(InfraError::Connectivity(format!(
                    "{} pool is closed",
                    self.inner.role
                )));
            }
            Err(_) => {
                tracing::warn!(role = %self.inner.role, "connection pool exhausted");
                return Err(InfraError::PoolExhausted {
                    waited: started.elapsed(),
                });
            }
        };

        let recycle_after = self.inner.config.recycle_after();
        while let Some(IdleConnection {
            mut conn,
            created_at,
        }) = self.inner.take_idle()
        {
            if created_at.elapsed() >= recycle_after {
                tracing::debug!(role = %self.inner.role, "recycling aged connection");
                spawn_close::<C>(conn);
                continue;
            }
            if self.inner.config.pre_ping
                && let Err(e) = conn.ping().await
            {
                tracing::info!(role = %self.inner.role, error = %e, "discarding dead pooled connection");
                continue;
            }
            return Ok(PooledConnection::new(conn, created_at, permit, &self.inner));
        }

        let conn = self.inner.connector.connect().await?;
        tracing::debug!(role = %self.inner.role, "opened new connection");
        Ok(PooledConnection::new(conn, Instant::now(), permit, &self.inner))
    }

    /// Closes the pool: pending and future checkouts fail, idle
    /// connections are closed, and checked-out connections are closed
    /// when returned.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();
        let drained: Vec<_> = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let count = drained.len();
        for idle in drained {
            if let Err(e) = idle.conn.close().await {
                tracing::debug!(error = %e, "error while closing idle connection");
            }
        }
        tracing::info!(role = %self.inner.role, closed = count, "connection pool closed");
    }

    /// Returns `true` once [`ConnectionPool::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// A checked-out connection. Returned to its pool on drop.
///
/// If the holder left a transaction open (see
/// [`PooledConnection::mark_needs_rollback`]), the connection is rolled
/// back on a background task before it re-enters the idle set and before
/// its capacity permit is released.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    created_at: Instant,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<C>>,
    needs_rollback: bool,
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("role", &self.pool.role)
            .field("age", &self.created_at.elapsed())
            .field("needs_rollback", &self.needs_rollback)
            .finish()
    }
}

impl<C: Connector> PooledConnection<C> {
    fn new(
        conn: C::Connection,
        created_at: Instant,
        permit: OwnedSemaphorePermit,
        pool: &Arc<PoolInner<C>>,
    ) -> Self {
        Self {
            conn: Some(conn),
            created_at,
            permit: Some(permit),
            pool: Arc::clone(pool),
            needs_rollback: false,
        }
    }

    /// Flags that an open transaction must be rolled back before reuse.
    pub fn mark_needs_rollback(&mut self, needed: bool) {
        self.needs_rollback = needed;
    }
}

impl<C: Connector> std::ops::Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<C: Connector> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let permit = self.permit.take();
        let created_at = self.created_at;

        if !self.needs_rollback {
            self.pool.checkin(conn, created_at);
            drop(permit);
            return;
        }

        let pool = Arc::clone(&self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match conn.rollback().await {
                        Ok(()) => {
                            tracing::debug!(role = %pool.role, "rolled back abandoned transaction");
                            pool.checkin(conn, created_at);
                        }
                        Err(e) => {
                            tracing::warn!(role = %pool.role, error = %e, "rollback of abandoned transaction failed; discarding connection");
                        }
                    }
                    drop(permit);
                });
            }
            Err(_) => {
                tracing::warn!(role = %pool.role, "no runtime to roll back abandoned transaction; discarding connection");
                drop(conn);
                drop(permit);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::test_support::{Event, MockConnector};

    fn config(max_connections: u32, max_overflow: u32) -> PoolConfig {
        PoolConfig {
            max_connections,
            max_overflow,
            connect_timeout_s: 2,
            recycle_after_s: 60,
            pre_ping: true,
        }
    }

    fn pool(connector: &MockConnector, cfg: PoolConfig) -> ConnectionPool<MockConnector> {
        let Ok(pool) = ConnectionPool::new(Role::Primary, cfg, connector.clone()) else {
            panic!("valid config");
        };
        pool
    }

    #[test]
    fn zero_connections_is_rejected() {
        let result = ConnectionPool::new(Role::Primary, config(0, 5), MockConnector::new());
        assert!(matches!(result, Err(InfraError::Config(_))));
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let connector = MockConnector::new();
        let pool = pool(&connector, config(2, 0));

        let Ok(first) = pool.acquire().await else {
            panic!("acquire");
        };
        let first_id = first.id();
        assert_eq!(pool.status().in_use, 1);
        drop(first);
        assert_eq!(
            pool.status(),
            PoolStatus {
                idle: 1,
                in_use: 0,
                capacity: 2
            }
        );

        let Ok(second) = pool.acquire().await else {
            panic!("acquire");
        };
        assert_eq!(second.id(), first_id);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_times_out() {
        let connector = MockConnector::new();
        let pool = pool(&connector, config(1, 0));

        let Ok(_held) = pool.acquire().await else {
            panic!("acquire");
        };
        let result = pool.acquire().await;
        let Err(InfraError::PoolExhausted { waited }) = result else {
            panic!("expected pool exhaustion");
        };
        assert!(waited >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_proceeds_when_connection_is_released() {
        let connector = MockConnector::new();
        let pool = pool(&connector, config(1, 0));

        let Ok(held) = pool.acquire().await else {
            panic!("acquire");
        };
        let held_id = held.id();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await.map(|c| c.id()) });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!waiter.is_finished());
        drop(held);

        let Ok(Ok(id)) = waiter.await else {
            panic!("waiter should get the released connection");
        };
        assert_eq!(id, held_id);
    }

    #[tokio::test]
    async fn overflow_connections_are_closed_on_return() {
        let connector = MockConnector::new();
        let pool = pool(&connector, config(1, 1));

        let (Ok(a), Ok(b)) = (pool.acquire().await, pool.acquire().await) else {
            panic!("both checkouts fit in capacity");
        };
        let overflow_id = b.id();
        drop(a);
        drop(b);
        tokio::task::yield_now().await;

        assert_eq!(pool.status().idle, 1);
        assert!(connector.events().contains(&Event::Close(overflow_id)));
    }

    #[tokio::test]
    async fn dead_idle_connection_is_replaced_transparently() {
        let connector = MockConnector::new();
        let pool = pool(&connector, config(1, 0));

        let Ok(first) = pool.acquire().await else {
            panic!("acquire");
        };
        let dead_id = first.id();
        drop(first);
        connector.kill(dead_id);

        let Ok(second) = pool.acquire().await else {
            panic!("replacement should be transparent");
        };
        assert_ne!(second.id(), dead_id);
        assert!(connector.events().contains(&Event::Ping(dead_id)));
    }

    #[tokio::test]
    async fn replacement_failure_surfaces() {
        let connector = MockConnector::new();
        let pool = pool(&connector, config(1, 0));

        let Ok(first) = pool.acquire().await else {
            panic!("acquire");
        };
        let dead_id = first.id();
        drop(first);
        connector.kill(dead_id);
        connector.set_fail_connect(true);

        assert!(matches!(
            pool.acquire().await,
            Err(InfraError::Connectivity(_))
        ));
        assert_eq!(pool.status().in_use, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn aged_connection_is_recycled() {
        let connector = MockConnector::new();
        let pool = pool(&connector, config(1, 0));

        let Ok(first) = pool.acquire().await else {
            panic!("acquire");
        };
        let old_id = first.id();
        drop(first);

        tokio::time::advance(Duration::from_secs(61)).await;

        let Ok(second) = pool.acquire().await else {
            panic!("acquire");
        };
        assert_ne!(second.id(), old_id);
        assert!(!connector.events().contains(&Event::Ping(old_id)));
    }

    #[tokio::test]
    async fn closed_pool_rejects_checkout() {
        let connector = MockConnector::new();
        let pool = pool(&connector, config(1, 0));
        let Ok(conn) = pool.acquire().await else {
            panic!("acquire");
        };
        let id = conn.id();
        drop(conn);

        pool.close().await;
        assert!(pool.is_closed());
        assert!(connector.events().contains(&Event::Close(id)));
        assert!(matches!(
            pool.acquire().await,
            Err(InfraError::Connectivity(_))
        ));
    }
}

//! Lazily-constructed engines, one per role.
//!
//! [`EngineRegistry`] is built explicitly at startup and injected where
//! sessions are needed. Building it performs no I/O; each role's
//! [`Engine`] is constructed on the first [`EngineRegistry::get_engine`]
//! call for that role. Concurrent first callers share one construction,
//! and a failed construction leaves the slot empty so the next caller
//! retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::Role;
use super::connection::{Connection, Connector, PgConnector};
use super::pool::ConnectionPool;
use crate::config::{DatabaseConfig, PoolConfig};
use crate::error::InfraError;

/// A constructed engine: the live pool for one role.
pub struct Engine<C: Connector> {
    id: Uuid,
    role: Role,
    created_at: DateTime<Utc>,
    pool: ConnectionPool<C>,
}

impl<C: Connector> std::fmt::Debug for Engine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("created_at", &self.created_at)
            .field("pool", &self.pool)
            .finish()
    }
}

impl<C: Connector> Engine<C> {
    /// Builds the pool and verifies the database is reachable.
    ///
    /// The probe connection is closed again, so a new engine starts with
    /// an empty pool.
    async fn connect(role: Role, config: PoolConfig, connector: C) -> Result<Self, InfraError> {
        let pool = ConnectionPool::new(role, config, connector)?;
        let mut probe = pool.connector().connect().await?;
        probe.ping().await?;
        if let Err(e) = probe.close().await {
            tracing::debug!(%role, error = %e, "error closing probe connection");
        }
        let engine = Self {
            id: Uuid::new_v4(),
            role,
            created_at: Utc::now(),
            pool,
        };
        tracing::info!(%role, engine_id = %engine.id, "database engine initialized");
        Ok(engine)
    }

    /// Unique id of this engine instance.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Role served by this engine.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// When the engine was constructed.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The engine's connection pool.
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Closes every pooled physical connection.
    pub async fn dispose(&self) {
        self.pool.close().await;
        tracing::info!(role = %self.role, engine_id = %self.id, "database engine disposed");
    }
}

type Slot<C> = Arc<OnceCell<Arc<Engine<C>>>>;

/// Owner of the per-role engines.
pub struct EngineRegistry<C: Connector> {
    settings: HashMap<Role, (PoolConfig, C)>,
    slots: Mutex<HashMap<Role, Slot<C>>>,
}

impl<C: Connector> std::fmt::Debug for EngineRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let initialized: Vec<Role> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(role, _)| *role)
            .collect();
        f.debug_struct("EngineRegistry")
            .field("roles", &self.settings.keys().collect::<Vec<_>>())
            .field("initialized", &initialized)
            .finish()
    }
}

impl EngineRegistry<PgConnector> {
    /// Registers the primary and scheduler roles against PostgreSQL.
    /// Opens no connections.
    #[must_use]
    pub fn postgres(config: &DatabaseConfig) -> Self {
        let mut registry = Self::new();
        for role in Role::ALL {
            let pool = config.pool_for(role).clone();
            let connector = PgConnector::new(config, pool.connect_timeout());
            registry = registry.with_role(role, pool, connector);
        }
        registry
    }
}

impl<C: Connector> EngineRegistry<C> {
    /// Creates a registry with no roles.
    #[must_use]
    pub fn new() -> Self {
        Self {
            settings: HashMap::new(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a role with its pool settings and connector.
    #[must_use]
    pub fn with_role(mut self, role: Role, config: PoolConfig, connector: C) -> Self {
        self.settings.insert(role, (config, connector));
        self
    }

    fn slot(&self, role: Role) -> Slot<C> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(role).or_default())
    }

    fn is_current(&self, role: Role, slot: &Slot<C>) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&role)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Returns the engine for `role`, constructing it on first use.
    ///
    /// An engine whose construction overlapped a
    /// [`EngineRegistry::dispose`] is disposed as well and replaced by a
    /// fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Config`] if the role was never registered and
    /// [`InfraError::Connectivity`] if the database cannot be reached. A
    /// failed construction is not cached.
    pub async fn get_engine(&self, role: Role) -> Result<Arc<Engine<C>>, InfraError> {
        loop {
            let slot = self.slot(role);
            let engine = slot
                .get_or_try_init(|| async {
                    let (config, connector) = self
                        .settings
                        .get(&role)
                        .ok_or_else(|| InfraError::Config(format!("no database role {role} configured")))?;
                    Engine::connect(role, config.clone(), connector.clone())
                        .await
                        .map(Arc::new)
                        .inspect_err(|e| tracing::error!(%role, error = %e, "database engine construction failed"))
                })
                .await
                .map(Arc::clone)?;
            if self.is_current(role, &slot) {
                return Ok(engine);
            }
            tracing::debug!(%role, engine_id = %engine.id(), "registry disposed during construction; discarding engine");
            engine.dispose().await;
        }
    }

    /// Returns `true` if the role's engine has been constructed.
    #[must_use]
    pub fn is_initialized(&self, role: Role) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&role)
            .is_some_and(|slot| slot.initialized())
    }

    /// Closes all engines and resets every slot. The next
    /// [`EngineRegistry::get_engine`] call constructs a fresh engine.
    pub async fn dispose(&self) {
        let slots = std::mem::take(&mut *self.slots.lock().unwrap_or_else(PoisonError::into_inner));
        for slot in slots.into_values() {
            if let Some(engine) = slot.get() {
                engine.dispose().await;
            }
        }
    }
}

impl<C: Connector> Default for EngineRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::db::test_support::{Event, MockConnector};

    fn registry(connector: &MockConnector) -> EngineRegistry<MockConnector> {
        let primary = PoolConfig {
            max_connections: 2,
            max_overflow: 1,
            connect_timeout_s: 1,
            recycle_after_s: 60,
            pre_ping: false,
        };
        let scheduler = PoolConfig {
            max_connections: 1,
            max_overflow: 0,
            ..primary.clone()
        };
        EngineRegistry::new()
            .with_role(Role::Primary, primary, connector.clone())
            .with_role(Role::Scheduler, scheduler, connector.clone())
    }

    #[tokio::test]
    async fn construction_is_deferred_to_first_use() {
        let connector = MockConnector::new();
        let registry = registry(&connector);
        assert_eq!(connector.connect_count(), 0);
        assert!(!registry.is_initialized(Role::Primary));

        let Ok(engine) = registry.get_engine(Role::Primary).await else {
            panic!("engine");
        };
        assert_eq!(engine.role(), Role::Primary);
        assert!(registry.is_initialized(Role::Primary));
        assert!(!registry.is_initialized(Role::Scheduler));
        assert_eq!(engine.pool().status().idle, 0);
    }

    #[tokio::test]
    async fn concurrent_first_callers_share_one_engine() {
        let connector = MockConnector::new();
        connector.set_connect_delay(Duration::from_millis(50));
        let registry = Arc::new(registry(&connector));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.get_engine(Role::Primary).await.map(|e| e.id())
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            let Ok(Ok(id)) = handle.await else {
                panic!("get_engine failed");
            };
            ids.insert(id);
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn roles_get_independent_engines() {
        let connector = MockConnector::new();
        let registry = registry(&connector);
        let (Ok(primary), Ok(scheduler)) = (
            registry.get_engine(Role::Primary).await,
            registry.get_engine(Role::Scheduler).await,
        ) else {
            panic!("engines");
        };
        assert_ne!(primary.id(), scheduler.id());
        assert_eq!(scheduler.pool().config().max_connections, 1);
    }

    #[tokio::test]
    async fn failed_construction_is_not_cached() {
        let connector = MockConnector::new();
        connector.set_fail_connect(true);
        let registry = registry(&connector);

        assert!(matches!(
            registry.get_engine(Role::Primary).await,
            Err(InfraError::Connectivity(_))
        ));
        assert!(!registry.is_initialized(Role::Primary));

        connector.set_fail_connect(false);
        assert!(registry.get_engine(Role::Primary).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_role_is_a_config_error() {
        let registry = EngineRegistry::new().with_role(
            Role::Primary,
            PoolConfig::default(),
            MockConnector::new(),
        );
        assert!(matches!(
            registry.get_engine(Role::Scheduler).await,
            Err(InfraError::Config(_))
        ));
    }

    #[tokio::test]
    async fn engine_built_across_dispose_is_replaced() {
        let connector = MockConnector::new();
        connector.set_connect_delay(Duration::from_millis(200));
        let registry = Arc::new(registry(&connector));

        let pending = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.get_engine(Role::Primary).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.dispose().await;

        let Ok(Ok(engine)) = pending.await else {
            panic!("get_engine across dispose");
        };
        assert!(!engine.pool().is_closed());
        assert!(registry.is_initialized(Role::Primary));
        assert_eq!(connector.connect_count(), 2);

        let Ok(current) = registry.get_engine(Role::Primary).await else {
            panic!("engine");
        };
        assert_eq!(current.id(), engine.id());

        registry.dispose().await;
        assert!(engine.pool().is_closed());
    }

    #[tokio::test]
    async fn dispose_then_get_yields_fresh_empty_engine() {
        let connector = MockConnector::new();
        let registry = registry(&connector);

        let Ok(first) = registry.get_engine(Role::Primary).await else {
            panic!("engine");
        };
        let Ok(conn) = first.pool().acquire().await else {
            panic!("acquire");
        };
        let conn_id = conn.id();
        drop(conn);
        assert_eq!(first.pool().status().idle, 1);

        registry.dispose().await;
        assert!(first.pool().is_closed());
        assert!(connector.events().contains(&Event::Close(conn_id)));
        assert!(!registry.is_initialized(Role::Primary));

        let Ok(second) = registry.get_engine(Role::Primary).await else {
            panic!("engine after dispose");
        };
        assert_ne!(first.id(), second.id());
        assert_eq!(second.pool().status().idle, 0);
        assert!(second.pool().acquire().await.is_ok());
    }
}

//! Database layer: connection pooling, lazily-built engines and scoped
//! sessions.
//!
//! The pool is generic over a [`Connector`] so the same checkout, recycle
//! and transaction logic runs against PostgreSQL in production and an
//! in-memory connector in tests.

pub mod connection;
pub mod engine;
pub mod pool;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use connection::{Connection, Connector, PgConnector};
pub use engine::{Engine, EngineRegistry};
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use session::{SessionHandle, SessionProvider, TransactionScope};

use serde::{Deserialize, Serialize};

/// Logical database usage context with its own pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Request-serving code.
    Primary,
    /// Scheduled background tasks.
    Scheduler,
}

impl Role {
    /// All roles, in startup order.
    pub const ALL: [Self; 2] = [Self::Primary, Self::Scheduler];

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Scheduler => "scheduler",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

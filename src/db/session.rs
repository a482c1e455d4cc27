//! Scoped sessions and transaction boundaries.
//!
//! A [`SessionHandle`] owns one pooled connection for its lifetime and
//! returns it on drop. [`SessionHandle::within_transaction`] opens a
//! [`TransactionScope`] that must be ended with
//! [`TransactionScope::commit`] or [`TransactionScope::rollback`]. A
//! scope dropped without either (an error path or a cancelled task) is
//! rolled back before its connection can be reused.
//!
//! Nested scopes join the enclosing transaction: committing one is a
//! no-op, and rolling one back marks the whole transaction rollback-only.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::Role;
use super::connection::{Connection, Connector};
use super::engine::EngineRegistry;
use super::pool::PooledConnection;
use crate::error::InfraError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    /// No transaction open.
    Idle,
    /// A transaction is open.
    Active,
    /// A nested scope failed; the outer commit will roll back instead.
    RollbackOnly,
    /// The outer scope was dropped without commit or rollback, or a
    /// BEGIN, COMMIT or ROLLBACK did not complete. The connection must be
    /// rolled back before reuse.
    Abandoned,
}

/// Hands out sessions against the registry's engines.
pub struct SessionProvider<C: Connector> {
    engines: Arc<EngineRegistry<C>>,
}

impl<C: Connector> Clone for SessionProvider<C> {
    fn clone(&self) -> Self {
        Self {
            engines: Arc::clone(&self.engines),
        }
    }
}

impl<C: Connector> std::fmt::Debug for SessionProvider<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProvider")
            .field("engines", &self.engines)
            .finish()
    }
}

impl<C: Connector> SessionProvider<C> {
    /// Creates a provider over the given registry.
    #[must_use]
    pub fn new(engines: Arc<EngineRegistry<C>>) -> Self {
        Self { engines }
    }

    /// The underlying engine registry.
    #[must_use]
    pub fn engines(&self) -> &Arc<EngineRegistry<C>> {
        &self.engines
    }

    /// Checks out a connection for `role` and wraps it in a session.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Connectivity`] if the engine cannot be built
    /// or a connection cannot be opened, and [`InfraError::PoolExhausted`]
    /// if no connection frees up within the checkout timeout.
    pub async fn open_session(&self, role: Role) -> Result<SessionHandle<C>, InfraError> {
        let engine = self.engines.get_engine(role).await?;
        let conn = engine.pool().acquire().await?;
        Ok(SessionHandle {
            role,
            conn,
            tx: TxState::Idle,
        })
    }
}

/// A single-owner session holding one pooled connection.
pub struct SessionHandle<C: Connector> {
    role: Role,
    conn: PooledConnection<C>,
    tx: TxState,
}

impl<C: Connector> std::fmt::Debug for SessionHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("role", &self.role)
            .field("tx", &self.tx)
            .field("conn", &self.conn)
            .finish()
    }
}

impl<C: Connector> SessionHandle<C> {
    /// Role this session was opened for.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns `true` while a transaction is open on this session.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        matches!(self.tx, TxState::Active | TxState::RollbackOnly)
    }

    /// Rolls back a transaction left behind by a dropped scope.
    async fn settle(&mut self) -> Result<(), InfraError> {
        if self.tx == TxState::Abandoned {
            self.conn.rollback().await?;
            self.tx = TxState::Idle;
            tracing::debug!(role = %self.role, "rolled back abandoned transaction");
        }
        Ok(())
    }

    /// Direct access to the connection for single statements outside a
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Transaction`] if rolling back a previously
    /// abandoned transaction fails.
    pub async fn connection(&mut self) -> Result<&mut C::Connection, InfraError> {
        self.settle().await?;
        Ok(&mut *self.conn)
    }

    /// Begins a transaction and returns its scope.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Transaction`] if `BEGIN` fails.
    pub async fn within_transaction(&mut self) -> Result<TransactionScope<'_, C>, InfraError> {
        self.settle().await?;
        self.tx = TxState::Abandoned;
        if let Err(e) = self.conn.begin().await {
            self.tx = TxState::Idle;
            return Err(e);
        }
        self.tx = TxState::Active;
        Ok(TransactionScope {
            session: self,
            outer: true,
            finished: false,
        })
    }

    /// Runs `body` inside a transaction.
    ///
    /// Commits when `body` returns `Ok`. When it returns `Err`, rolls back
    /// and hands back that same error; a failing rollback is logged and
    /// never replaces it. If the returned future is dropped mid-flight the
    /// transaction is rolled back before the connection is reused.
    ///
    /// # Errors
    ///
    /// Returns the body's error unchanged, or an [`InfraError`] (converted
    /// into `E`) if the transaction cannot be started or committed.
    pub async fn run_in_transaction<T, E, F>(&mut self, body: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut C::Connection) -> BoxFuture<'t, Result<T, E>>,
        E: From<InfraError>,
    {
        let mut scope = self.within_transaction().await?;
        match body(scope.connection()).await {
            Ok(value) => {
                scope.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = scope.rollback().await {
                    tracing::warn!(error = %rollback_err, "rollback after failed unit of work also failed");
                }
                Err(err)
            }
        }
    }
}

impl<C: Connector> Drop for SessionHandle<C> {
    fn drop(&mut self) {
        if self.tx != TxState::Idle {
            self.conn.mark_needs_rollback(true);
        }
    }
}

/// An open transaction on a session.
///
/// The outer scope owns the boundary. Nested scopes from
/// [`TransactionScope::within_transaction`] share it.
pub struct TransactionScope<'s, C: Connector> {
    session: &'s mut SessionHandle<C>,
    outer: bool,
    finished: bool,
}

impl<C: Connector> std::fmt::Debug for TransactionScope<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("role", &self.session.role)
            .field("outer", &self.outer)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<C: Connector> TransactionScope<'_, C> {
    /// Connection to run statements on. Statements execute in submission
    /// order inside this transaction.
    pub fn connection(&mut self) -> &mut C::Connection {
        &mut self.session.conn
    }

    /// Returns `true` for the scope that owns the transaction boundary.
    #[must_use]
    pub fn is_outer(&self) -> bool {
        self.outer
    }

    /// Opens a nested scope that joins this transaction.
    pub fn within_transaction(&mut self) -> TransactionScope<'_, C> {
        TransactionScope {
            session: &mut *self.session,
            outer: false,
            finished: false,
        }
    }

    /// Ends the scope successfully.
    ///
    /// A nested scope only signals success; the outer scope issues
    /// `COMMIT`, or rolls back if a nested scope failed.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Transaction`] if the commit fails or the
    /// transaction was marked rollback-only. In both cases the
    /// transaction is no longer open.
    pub async fn commit(mut self) -> Result<(), InfraError> {
        self.finished = true;
        if !self.outer {
            return Ok(());
        }
        let state = self.session.tx;
        self.session.tx = TxState::Abandoned;
        if state == TxState::RollbackOnly {
            self.session.conn.rollback().await?;
            self.session.tx = TxState::Idle;
            return Err(InfraError::Transaction(
                "transaction rolled back: a nested scope failed".to_string(),
            ));
        }
        if let Err(e) = self.session.conn.commit().await {
            match self.session.conn.rollback().await {
                Ok(()) => self.session.tx = TxState::Idle,
                Err(rb) => {
                    tracing::warn!(error = %rb, "rollback after failed commit also failed");
                }
            }
            return Err(e);
        }
        self.session.tx = TxState::Idle;
        Ok(())
    }

    /// Ends the scope with a rollback.
    ///
    /// A nested scope marks the transaction rollback-only; the outer scope
    /// issues `ROLLBACK`.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Transaction`] if `ROLLBACK` fails.
    pub async fn rollback(mut self) -> Result<(), InfraError> {
        self.finished = true;
        if !self.outer {
            self.session.tx = TxState::RollbackOnly;
            return Ok(());
        }
        self.session.tx = TxState::Abandoned;
        self.session.conn.rollback().await?;
        self.session.tx = TxState::Idle;
        Ok(())
    }
}

impl<C: Connector> Drop for TransactionScope<'_, C> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.outer {
            tracing::debug!(role = %self.session.role, "transaction scope dropped without commit");
            self.session.tx = TxState::Abandoned;
        } else if self.session.tx == TxState::Active {
            self.session.tx = TxState::RollbackOnly;
        }
    }
}

//! In-memory connector that records every call, for pool and session
//! tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::connection::{Connection, Connector};
use crate::error::InfraError;

/// Call recorded by the mock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Connect(usize),
    Ping(usize),
    Begin(usize),
    Commit(usize),
    Rollback(usize),
    Close(usize),
}

#[derive(Debug, Default)]
struct MockState {
    next_id: AtomicUsize,
    connects: AtomicUsize,
    fail_connect: AtomicBool,
    fail_commit: AtomicBool,
    stall_begin: AtomicBool,
    stall_commit: AtomicBool,
    connect_delay_ms: AtomicUsize,
    dead: Mutex<HashSet<usize>>,
    events: Mutex<Vec<Event>>,
}

impl MockState {
    fn record(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn is_dead(&self, id: usize) -> bool {
        self.dead
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.state.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// BEGIN reaches the server but never answers.
    pub fn set_stall_begin(&self, stall: bool) {
        self.state.stall_begin.store(stall, Ordering::SeqCst);
    }

    /// COMMIT never answers.
    pub fn set_stall_commit(&self, stall: bool) {
        self.state.stall_commit.store(stall, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        let ms = usize::try_from(delay.as_millis()).unwrap_or(usize::MAX);
        self.state.connect_delay_ms.store(ms, Ordering::SeqCst);
    }

    pub fn kill(&self, id: usize) {
        self.state
            .dead
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection, InfraError> {
        let delay = self.state.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(InfraError::Connectivity("connection refused".to_string()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        self.state.record(Event::Connect(id));
        Ok(MockConnection {
            id,
            state: Arc::clone(&self.state),
        })
    }
}

#[derive(Debug)]
pub struct MockConnection {
    id: usize,
    state: Arc<MockState>,
}

impl MockConnection {
    pub fn id(&self) -> usize {
        self.id
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn ping(&mut self) -> Result<(), InfraError> {
        self.state.record(Event::Ping(self.id));
        if self.state.is_dead(self.id) {
            return Err(InfraError::Connectivity("server closed the connection".to_string()));
        }
        Ok(())
    }

    async fn begin(&mut self) -> Result<(), InfraError> {
        self.state.record(Event::Begin(self.id));
        if self.state.stall_begin.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), InfraError> {
        if self.state.stall_commit.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.state.fail_commit.load(Ordering::SeqCst) {
            return Err(InfraError::Transaction("commit failed: serialization failure".to_string()));
        }
        self.state.record(Event::Commit(self.id));
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), InfraError> {
        self.state.record(Event::Rollback(self.id));
        Ok(())
    }

    async fn close(self) -> Result<(), InfraError> {
        self.state.record(Event::Close(self.id));
        Ok(())
    }
}

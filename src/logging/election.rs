//! Lease-based election of the single log consumer.
//!
//! Every process instance calls
//! [`MasterElection::try_acquire_or_renew`] on an interval shorter than
//! the lease. The shared store grants the lease when it is free, expired,
//! or already held by the caller, in one atomic step. A holder that stops
//! renewing loses the lease once it expires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};

use super::FALLBACK_TARGET;
use super::transport::connection_config;
use crate::clock::Clock;
use crate::config::RedisConfig;
use crate::error::InfraError;

/// Lease name for the log consumer. One per deployment, not per category.
pub const LOG_CONSUMER_LEASE: &str = "log-consumer";

/// Current lease holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterElectionState {
    /// Holder id of the owning instance.
    pub holder_process_id: String,
    /// Last acquisition or renewal.
    pub acquired_at: DateTime<Utc>,
    /// Lease length granted at that time, in milliseconds.
    pub lease_duration_ms: u64,
}

/// Shared store implementing the atomic lease operations.
#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    /// Grants `name` to `holder` if it is free, expired, or already held
    /// by `holder`. Returns whether `holder` owns the lease afterwards.
    async fn acquire_or_renew(
        &self,
        name: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<bool, InfraError>;

    /// Drops the lease if `holder` owns it. Returns whether it did.
    async fn release(&self, name: &str, holder: &str) -> Result<bool, InfraError>;

    /// Reads the current holder, if any.
    async fn current(&self, name: &str) -> Result<Option<MasterElectionState>, InfraError>;
}

fn lease_millis(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
}

/// In-process lease store driven by an injected clock.
#[derive(Debug)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, MasterElectionState>>,
    clock: Arc<dyn Clock>,
}

impl MemoryLeaseStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn acquire_or_renew(
        &self,
        name: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<bool, InfraError> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let grant = match leases.get(name) {
            None => true,
            Some(state) if state.holder_process_id == holder => true,
            Some(state) => {
                let held_for = now.signed_duration_since(state.acquired_at);
                let granted = i64::try_from(state.lease_duration_ms).unwrap_or(i64::MAX);
                held_for.num_milliseconds() > granted
            }
        };
        if grant {
            leases.insert(
                name.to_string(),
                MasterElectionState {
                    holder_process_id: holder.to_string(),
                    acquired_at: now,
                    lease_duration_ms: u64::try_from(lease.as_millis()).unwrap_or(u64::MAX),
                },
            );
        }
        Ok(grant)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool, InfraError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if leases
            .get(name)
            .is_some_and(|state| state.holder_process_id == holder)
        {
            leases.remove(name);
            return Ok(true);
        }
        Ok(false)
    }

    async fn current(&self, name: &str) -> Result<Option<MasterElectionState>, InfraError> {
        Ok(self
            .leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned())
    }
}

/// Atomic grant using the Redis server clock, so callers' clock drift
/// does not matter.
const ACQUIRE_SCRIPT: &str = r"
local t = redis.call('TIME')
local now_ms = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local holder = redis.call('HGET', KEYS[1], 'holder')
local acquired = tonumber(redis.call('HGET', KEYS[1], 'acquired_at') or '0')
local lease = tonumber(redis.call('HGET', KEYS[1], 'lease_ms') or '0')
if (not holder) or holder == ARGV[1] or (now_ms - acquired > lease) then
  redis.call('HSET', KEYS[1], 'holder', ARGV[1], 'acquired_at', now_ms, 'lease_ms', ARGV[2])
  redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[2]) * 2)
  return 1
end
return 0
";

const RELEASE_SCRIPT: &str = r"
if redis.call('HGET', KEYS[1], 'holder') == ARGV[1] then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
";

/// Lease store on a Redis hash per lease name.
#[derive(Clone)]
pub struct RedisLeaseStore {
    con: MultiplexedConnection,
    prefix: String,
    acquire: Arc<redis::Script>,
    release: Arc<redis::Script>,
}

impl std::fmt::Debug for RedisLeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLeaseStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisLeaseStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Connectivity`] if the server cannot be
    /// reached.
    pub async fn connect(config: &RedisConfig, prefix: impl Into<String>) -> Result<Self, InfraError> {
        let client = redis::Client::open(config.connection_info())
            .map_err(|e| InfraError::Connectivity(format!("invalid redis settings: {e}")))?;
        let con = client
            .get_multiplexed_async_connection_with_config(&connection_config(Duration::from_secs(5)))
            .await
            .map_err(|e| InfraError::Connectivity(format!("redis connect failed: {e}")))?;
        Ok(Self {
            con,
            prefix: prefix.into(),
            acquire: Arc::new(redis::Script::new(ACQUIRE_SCRIPT)),
            release: Arc::new(redis::Script::new(RELEASE_SCRIPT)),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}:lease:{}", self.prefix, name)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn acquire_or_renew(
        &self,
        name: &str,
        holder: &str,
        lease: Duration,
    ) -> Result<bool, InfraError> {
        let mut con = self.con.clone();
        let granted: i64 = self
            .acquire
            .key(self.key(name))
            .arg(holder)
            .arg(lease_millis(lease))
            .invoke_async(&mut con)
            .await?;
        Ok(granted == 1)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool, InfraError> {
        let mut con = self.con.clone();
        let released: i64 = self
            .release
            .key(self.key(name))
            .arg(holder)
            .invoke_async(&mut con)
            .await?;
        Ok(released == 1)
    }

    async fn current(&self, name: &str) -> Result<Option<MasterElectionState>, InfraError> {
        let mut con = self.con.clone();
        let (holder, acquired_ms, lease_ms): (Option<String>, Option<i64>, Option<i64>) =
            redis::cmd("HMGET")
                .arg(self.key(name))
                .arg("holder")
                .arg("acquired_at")
                .arg("lease_ms")
                .query_async(&mut con)
                .await?;
        let (Some(holder), Some(acquired_ms)) = (holder, acquired_ms) else {
            return Ok(None);
        };
        let Some(acquired_at) = DateTime::<Utc>::from_timestamp_millis(acquired_ms) else {
            return Ok(None);
        };
        Ok(Some(MasterElectionState {
            holder_process_id: holder,
            acquired_at,
            lease_duration_ms: u64::try_from(lease_ms.unwrap_or(0)).unwrap_or(0),
        }))
    }
}

/// One participant in the log-consumer election.
#[derive(Debug, Clone)]
pub struct MasterElection {
    store: Arc<dyn LeaseStore>,
    name: String,
    holder_id: String,
}

impl MasterElection {
    /// Creates a participant with a unique holder id of the form
    /// `"{pid}:{uuid}"`.
    #[must_use]
    pub fn new(store: Arc<dyn LeaseStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            holder_id: format!("{}:{}", std::process::id(), uuid::Uuid::new_v4()),
        }
    }

    /// This participant's holder id.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// The store backing this election.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Acquires or renews the lease. Returns `true` while this instance
    /// holds it.
    ///
    /// A contested lease is a normal `false`. Store failures and calls
    /// that do not finish within a third of the lease are reported on the
    /// fallback channel and also count as `false`.
    pub async fn try_acquire_or_renew(&self, lease_duration: Duration) -> bool {
        let budget = (lease_duration / 3).max(Duration::from_millis(100));
        match tokio::time::timeout(
            budget,
            self.store
                .acquire_or_renew(&self.name, &self.holder_id, lease_duration),
        )
        .await
        {
            Ok(Ok(held)) => held,
            Ok(Err(e)) => {
                tracing::warn!(target: FALLBACK_TARGET, lease = %self.name, error = %e, "lease renewal failed");
                false
            }
            Err(_) => {
                tracing::warn!(target: FALLBACK_TARGET, lease = %self.name, "lease renewal timed out");
                false
            }
        }
    }

    /// Gives the lease up early so another instance can take over without
    /// waiting for expiry.
    pub async fn release(&self) {
        match self.store.release(&self.name, &self.holder_id).await {
            Ok(true) => tracing::info!(lease = %self.name, "lease released"),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(target: FALLBACK_TARGET, lease = %self.name, error = %e, "lease release failed");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use futures_util::future::join_all;

    use super::*;
    use crate::clock::ManualClock;

    const LEASE: Duration = Duration::from_secs(5);

    fn cluster(clock: &ManualClock, n: usize) -> (Arc<MemoryLeaseStore>, Vec<MasterElection>) {
        let store = Arc::new(MemoryLeaseStore::new(Arc::new(clock.clone())));
        let members = (0..n)
            .map(|_| {
                MasterElection::new(
                    Arc::clone(&store) as Arc<dyn LeaseStore>,
                    LOG_CONSUMER_LEASE,
                )
            })
            .collect();
        (store, members)
    }

    async fn round(members: &[MasterElection]) -> Vec<bool> {
        join_all(members.iter().map(|m| m.try_acquire_or_renew(LEASE))).await
    }

    #[tokio::test]
    async fn exactly_one_of_three_wins() {
        let clock = ManualClock::new(Utc::now());
        let (_store, members) = cluster(&clock, 3);

        let results = round(&members).await;
        assert_eq!(results.iter().filter(|won| **won).count(), 1);

        clock.advance(chrono::Duration::seconds(2));
        let again = round(&members).await;
        assert_eq!(results, again, "holder keeps the lease while renewing");
    }

    #[tokio::test]
    async fn lease_moves_after_holder_goes_silent() {
        let clock = ManualClock::new(Utc::now());
        let (store, members) = cluster(&clock, 3);

        let results = round(&members).await;
        let Some(holder_idx) = results.iter().position(|won| *won) else {
            panic!("someone must win");
        };
        let others: Vec<&MasterElection> = members
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != holder_idx)
            .map(|(_, m)| m)
            .collect();

        clock.advance(chrono::Duration::seconds(4));
        for other in &others {
            assert!(!other.try_acquire_or_renew(LEASE).await);
        }

        clock.advance(chrono::Duration::milliseconds(1_001));
        let takeover = join_all(others.iter().map(|m| m.try_acquire_or_renew(LEASE))).await;
        assert_eq!(takeover.iter().filter(|won| **won).count(), 1);

        let Ok(Some(state)) = store.current(LOG_CONSUMER_LEASE).await else {
            panic!("lease should be held");
        };
        assert_ne!(
            state.holder_process_id,
            members.get(holder_idx).map(|m| m.holder_id().to_string()).unwrap_or_default()
        );
    }

    #[tokio::test]
    async fn sub_second_lease_is_held_for_its_full_length() {
        let clock = ManualClock::new(Utc::now());
        let (store, members) = cluster(&clock, 2);
        let (Some(a), Some(b)) = (members.first(), members.get(1)) else {
            panic!("two members");
        };
        let short = Duration::from_millis(600);

        assert!(a.try_acquire_or_renew(short).await);
        clock.advance(chrono::Duration::milliseconds(400));
        assert!(!b.try_acquire_or_renew(short).await);

        let Ok(Some(state)) = store.current(LOG_CONSUMER_LEASE).await else {
            panic!("lease should be held");
        };
        assert_eq!(state.lease_duration_ms, 600);

        clock.advance(chrono::Duration::milliseconds(201));
        assert!(b.try_acquire_or_renew(short).await);
    }

    #[tokio::test]
    async fn release_frees_lease_immediately() {
        let clock = ManualClock::new(Utc::now());
        let (store, members) = cluster(&clock, 2);
        let (Some(a), Some(b)) = (members.first(), members.get(1)) else {
            panic!("two members");
        };

        assert!(a.try_acquire_or_renew(LEASE).await);
        assert!(!b.try_acquire_or_renew(LEASE).await);

        b.release().await;
        assert!(matches!(store.current(LOG_CONSUMER_LEASE).await, Ok(Some(_))));

        a.release().await;
        assert!(matches!(store.current(LOG_CONSUMER_LEASE).await, Ok(None)));
        assert!(b.try_acquire_or_renew(LEASE).await);
    }

    #[test]
    fn holder_ids_are_unique_within_a_process() {
        let store: Arc<dyn LeaseStore> =
            Arc::new(MemoryLeaseStore::new(Arc::new(crate::clock::SystemClock)));
        let a = MasterElection::new(Arc::clone(&store), LOG_CONSUMER_LEASE);
        let b = MasterElection::new(store, LOG_CONSUMER_LEASE);
        assert_ne!(a.holder_id(), b.holder_id());
        assert!(a.holder_id().starts_with(&std::process::id().to_string()));
    }
}

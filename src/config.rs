//! Infrastructure configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Parsing is done over a lookup
//! function so the same code path serves both the real environment and
//! tests.

use std::net::SocketAddr;
use std::time::Duration;

use crate::db::Role;
use crate::error::InfraError;

/// Deployment environment, drives default log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    /// Local development: verbose logs.
    Development,
    /// Test/staging environments.
    Testing,
    /// Production: warnings and above for application logs.
    Production,
}

impl AppEnv {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "testing" | "test" | "preview" => Self::Testing,
            _ => Self::Development,
        }
    }

    /// Default `EnvFilter` directive for this environment.
    ///
    /// Application logs follow the environment; data-access logs stay at
    /// `info` in production and `debug` everywhere else.
    #[must_use]
    pub fn default_log_filter(self) -> String {
        let (app, sql) = match self {
            Self::Development => ("debug", "debug"),
            Self::Testing => ("info", "debug"),
            Self::Production => ("warn", "info"),
        };
        format!("{app},sqlx={sql},service_infra::db={sql}")
    }
}

/// Connection pool sizing and lifetime settings for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections kept in the pool.
    pub max_connections: u32,
    /// Extra connections allowed beyond `max_connections` under load.
    /// They are closed instead of pooled once returned.
    pub max_overflow: u32,
    /// Seconds a checkout may wait for a free connection.
    pub connect_timeout_s: u64,
    /// Maximum lifetime of a pooled physical connection, in seconds.
    pub recycle_after_s: u64,
    /// Probe idle connections before handing them out.
    pub pre_ping: bool,
}

impl PoolConfig {
    /// Checks the pool invariants.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Config`] if `max_connections` is zero.
    pub fn validate(&self) -> Result<(), InfraError> {
        if self.max_connections == 0 {
            return Err(InfraError::Config(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Total number of connections that may be checked out at once.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let total = u64::from(self.max_connections) + u64::from(self.max_overflow);
        usize::try_from(total).unwrap_or(usize::MAX)
    }

    /// Checkout timeout as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }

    /// Connection recycle age as a [`Duration`].
    #[must_use]
    pub fn recycle_after(&self) -> Duration {
        Duration::from_secs(self.recycle_after_s)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            max_overflow: 10,
            connect_timeout_s: 30,
            recycle_after_s: 1800,
            pre_ping: true,
        }
    }
}

/// PostgreSQL connection settings shared by all roles.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Database host name.
    pub host: String,
    /// Database port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Login password.
    pub password: String,
    /// Database name.
    pub database: String,
    /// Pool settings for request-serving code.
    pub primary_pool: PoolConfig,
    /// Pool settings for scheduled tasks.
    pub scheduler_pool: PoolConfig,
}

impl DatabaseConfig {
    /// Returns the pool settings for the given role.
    #[must_use]
    pub fn pool_for(&self, role: Role) -> &PoolConfig {
        match role {
            Role::Primary => &self.primary_pool,
            Role::Scheduler => &self.scheduler_pool,
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("database", &self.database)
            .field("primary_pool", &self.primary_pool)
            .field("scheduler_pool", &self.scheduler_pool)
            .finish()
    }
}

/// Redis settings for the log transport and the election store.
#[derive(Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// Redis host name.
    pub host: String,
    /// Redis port.
    pub port: u16,
    /// Optional password; `None` when unset or empty.
    pub password: Option<String>,
    /// Logical database index.
    pub database: u32,
}

impl RedisConfig {
    /// Structured connection settings. The password is passed as-is, so
    /// it may contain characters that are reserved in URLs.
    #[must_use]
    pub fn connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: i64::from(self.database),
                password: self.password.clone(),
                ..redis::RedisConnectionInfo::default()
            },
        }
    }
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .finish()
    }
}

/// Log pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPipelineConfig {
    /// Directory receiving the rotated log files.
    pub log_dir: std::path::PathBuf,
    /// Days a dated log file is kept before the sweep deletes it.
    pub retention_days: u32,
    /// Election lease duration in seconds.
    pub lease_secs: u64,
    /// Capacity of the in-process emit buffer.
    pub buffer_capacity: usize,
    /// Key prefix for the per-category queues.
    pub queue_prefix: String,
    /// Maximum records drained per category per cycle.
    pub batch_size: usize,
}

impl LogPipelineConfig {
    /// Lease duration as a [`Duration`].
    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

impl Default for LogPipelineConfig {
    fn default() -> Self {
        Self {
            log_dir: std::path::PathBuf::from("logs"),
            retention_days: 7,
            lease_secs: 15,
            buffer_capacity: 10_000,
            queue_prefix: "app:logs".to_string(),
            batch_size: 100,
        }
    }
}

/// Top-level configuration.
///
/// Loaded once at startup via [`InfraConfig::from_env`].
#[derive(Debug, Clone)]
pub struct InfraConfig {
    /// Deployment environment.
    pub env: AppEnv,
    /// Socket address the health endpoint binds to.
    pub listen_addr: SocketAddr,
    /// Database settings.
    pub database: DatabaseConfig,
    /// Redis settings.
    pub redis: RedisConfig,
    /// Log pipeline settings.
    pub logging: LogPipelineConfig,
}

impl InfraConfig {
    /// Loads configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Config`] if `LISTEN_ADDR` cannot be parsed or
    /// a pool is configured with zero connections.
    pub fn from_env() -> Result<Self, InfraError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    ///
    /// Falls back to defaults when a key is missing or invalid.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Config`] if `LISTEN_ADDR` cannot be parsed or
    /// a pool is configured with zero connections.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, InfraError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = AppEnv::parse(&lookup("APP_ENV").unwrap_or_default());

        let raw_addr = lookup("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8001".to_string());
        let listen_addr: SocketAddr = raw_addr
            .parse()
            .map_err(|e| InfraError::Config(format!("invalid LISTEN_ADDR {raw_addr:?}: {e}")))?;

        let defaults = PoolConfig::default();
        let connect_timeout_s = parse_env(&lookup, "DB_CONNECT_TIMEOUT_SECS", defaults.connect_timeout_s);
        let recycle_after_s = parse_env(&lookup, "DB_RECYCLE_SECS", defaults.recycle_after_s);
        let pre_ping = parse_env_bool(&lookup, "DB_PRE_PING", defaults.pre_ping);

        let primary_pool = PoolConfig {
            max_connections: parse_env(&lookup, "DB_POOL_SIZE", defaults.max_connections),
            max_overflow: parse_env(&lookup, "DB_MAX_OVERFLOW", defaults.max_overflow),
            connect_timeout_s,
            recycle_after_s,
            pre_ping,
        };
        let scheduler_pool = PoolConfig {
            max_connections: parse_env(&lookup, "SCHEDULER_DB_POOL_SIZE", 5),
            max_overflow: parse_env(&lookup, "SCHEDULER_DB_MAX_OVERFLOW", 5),
            connect_timeout_s,
            recycle_after_s,
            pre_ping,
        };
        primary_pool.validate()?;
        scheduler_pool.validate()?;

        let database = DatabaseConfig {
            host: lookup("POSTGRES_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_env(&lookup, "POSTGRES_PORT", 5432),
            user: lookup("POSTGRES_USER").unwrap_or_else(|| "app".to_string()),
            password: lookup("POSTGRES_PASSWORD").unwrap_or_else(|| "app".to_string()),
            database: lookup("POSTGRES_DB").unwrap_or_else(|| "app".to_string()),
            primary_pool,
            scheduler_pool,
        };

        let redis = RedisConfig {
            host: lookup("REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_env(&lookup, "REDIS_PORT", 6379),
            password: lookup("REDIS_PASSWORD").filter(|p| !p.is_empty()),
            database: parse_env(&lookup, "REDIS_DB", 0),
        };

        let log_defaults = LogPipelineConfig::default();
        let logging = LogPipelineConfig {
            log_dir: lookup("LOG_DIR").map_or(log_defaults.log_dir, std::path::PathBuf::from),
            retention_days: parse_env(&lookup, "LOG_RETENTION_DAYS", log_defaults.retention_days),
            lease_secs: parse_env(&lookup, "LOG_LEASE_SECS", log_defaults.lease_secs).max(1),
            buffer_capacity: parse_env(&lookup, "LOG_BUFFER_CAPACITY", log_defaults.buffer_capacity)
                .max(1),
            queue_prefix: lookup("LOG_QUEUE_PREFIX").unwrap_or(log_defaults.queue_prefix),
            batch_size: parse_env(&lookup, "LOG_BATCH_SIZE", log_defaults.batch_size).max(1),
        };

        Ok(Self {
            env,
            listen_addr,
            database,
            redis,
            logging,
        })
    }
}

/// Parses a key as `T`, returning `default` on missing or invalid values.
fn parse_env<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parses a key as a boolean. Accepts `"true"`, `"1"`, `"false"`, `"0"`
/// (case-insensitive). Returns `default` otherwise.
fn parse_env_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}

//! # service-infra
//!
//! Process-lifecycle infrastructure for web services: pooled database
//! sessions with explicit transaction boundaries, and a queue-backed
//! structured-logging pipeline with a single elected consumer.
//!
//! ## Architecture
//!
//! ```text
//! Request handlers / scheduled tasks
//!     │
//!     ├── SessionProvider (db/session)      ── tracing events ──┐
//!     │       │                                                 │
//!     │   EngineRegistry (db/engine)                            │
//!     │       │                                                 ▼
//!     │   ConnectionPool (db/pool)                  EmitterLayer / LogEmitter
//!     │       │                                                 │
//!     │   PostgreSQL (sqlx)                          LogTransport (Redis list)
//!     │                                                         │
//!     └── /health (api)              MasterElection ──▶ ConsumerWorker
//!                                                               │
//!                                                   RotatingFileSink (logs/)
//! ```

pub mod api;
pub mod app_state;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod logging;
pub mod runtime;

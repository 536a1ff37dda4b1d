//! gnmi-gateway-core: target connection lifecycle for a gNMI telemetry gateway
//!
//! One [`TargetConnection`] per configured device keeps a streaming
//! subscription open and feeds what it receives into that device's cache.
//! Connections are admitted through a process-wide slot pool and a per-target
//! fleet lock, so redundant gateway instances never subscribe to the same
//! device twice.
//!
//! # Architecture
//!
//! ```text
//! TargetConfiguration → Supervisor → TargetConnection::acquire_and_run
//!                                          │ slot pool + fleet lock
//!                                          ▼
//!                           Transport::subscribe → Subscription events
//!                                          │ rejection filter
//!                                          ▼
//!                                   TargetCacheSink
//! ```
//!
//! # Modules
//!
//! - `connection`: per-target acquisition loop and update handling
//! - `supervisor`: reconciles running connections with the configuration
//! - `state`: connection phases and their transitions
//! - `pool`: process-wide connection slot pool
//! - `lock`: per-target fleet locks (in-process or lock files)
//! - `transport`: subscription transport contract and the loopback transport
//! - `cache`: target cache sink contract and the in-memory cache
//! - `filter`: denylist for malformed device paths
//! - `proto`: gNMI message model
//! - `target`: target identities and the target configuration document
//! - `config`: gateway configuration
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod filter;
pub mod lock;
pub mod logging;
pub mod pool;
pub mod proto;
pub mod state;
pub mod supervisor;
pub mod target;
pub mod transport;

pub use cache::{Cache, CacheError, TargetCache, TargetCacheSink};
pub use config::GatewayConfig;
pub use connection::{ConnectOutcome, ConnectionSettings, ConnectionStatus, TargetConnection};
pub use error::{GatewayError, Result};
pub use filter::RejectionScope;
pub use lock::{FileLockProvider, LocalLockRegistry, LockGate, LockProvider};
pub use pool::{ConnectionSlotPool, SlotPermit, SlotPoolStats};
pub use state::ConnectionPhase;
pub use supervisor::{ApplySummary, TargetConnectionSupervisor};
pub use target::{Credentials, TargetConfiguration, TargetDescriptor};
pub use transport::{CloseHandle, Query, Subscription, Transport, TransportEvent};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

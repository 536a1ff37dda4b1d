//! Supervisor for the target connections of one gateway.
//!
//! Reconciles the running set of [`TargetConnection`]s with a
//! [`TargetConfiguration`]: new targets get a connection and a task, targets
//! whose identity or request changed are stopped and started again, and
//! targets that disappeared are stopped and their cache dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{Cache, TargetCacheSink};
use crate::config::{GatewayConfig, LockBackend};
use crate::connection::{ConnectionSettings, ConnectionStatus, TargetConnection};
use crate::error::{GatewayError, Result};
use crate::lock::{FileLockProvider, LocalLockRegistry, LockProvider};
use crate::pool::{ConnectionSlotPool, SlotPoolStats};
use crate::target::TargetConfiguration;
use crate::transport::Transport;

/// What one [`TargetConnectionSupervisor::apply`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub added: Vec<String>,
    pub replaced: Vec<String>,
    pub removed: Vec<String>,
    pub kept: Vec<String>,
}

/// Counters over the supervisor's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorMetrics {
    pub applies: u64,
    pub targets_started: u64,
    pub targets_stopped: u64,
    /// Tasks that did not exit within the grace period and were aborted.
    pub tasks_aborted: u64,
}

struct SupervisedTarget {
    connection: Arc<TargetConnection>,
    task: JoinHandle<()>,
}

/// Owns one [`TargetConnection`] and task per configured target.
pub struct TargetConnectionSupervisor {
    settings: ConnectionSettings,
    shutdown_grace: Duration,
    cache: Arc<Cache>,
    transport: Arc<dyn Transport>,
    locks: Arc<dyn LockProvider>,
    pool: Arc<ConnectionSlotPool>,
    targets: HashMap<String, SupervisedTarget>,
    metrics: SupervisorMetrics,
}

impl TargetConnectionSupervisor {
    #[must_use]
    pub fn new(
        config: &GatewayConfig,
        cache: Arc<Cache>,
        transport: Arc<dyn Transport>,
        locks: Arc<dyn LockProvider>,
    ) -> Self {
        Self {
            settings: config.connection_settings(),
            shutdown_grace: config.shutdown_grace(),
            cache,
            transport,
            locks,
            pool: Arc::new(ConnectionSlotPool::new(config.target_limit)),
            targets: HashMap::new(),
            metrics: SupervisorMetrics::default(),
        }
    }

    /// Like [`new`](Self::new), with the lock backend chosen by `config.lock`.
    pub fn from_config(
        config: &GatewayConfig,
        cache: Arc<Cache>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let locks: Arc<dyn LockProvider> = match config.lock.backend {
            LockBackend::Local => Arc::new(LocalLockRegistry::new()),
            LockBackend::File => {
                let dir = config.lock.dir.clone().ok_or_else(|| {
                    GatewayError::Config("lock.dir is required for the file lock backend".into())
                })?;
                Arc::new(FileLockProvider::new(dir)?)
            }
        };
        Ok(Self::new(config, cache, transport, locks))
    }

    /// Bring the running targets in line with `configuration`.
    ///
    /// Stopped targets are awaited (up to the shutdown grace) before their
    /// replacements start, so the old subscription has released its lock and
    /// reset its cache first.
    pub async fn apply(&mut self, configuration: &TargetConfiguration) -> Result<ApplySummary> {
        configuration.validate()?;
        self.metrics.applies += 1;
        let mut summary = ApplySummary::default();

        let mut departed: Vec<String> = self
            .targets
            .keys()
            .filter(|name| !configuration.targets.contains_key(*name))
            .cloned()
            .collect();
        departed.sort();
        for name in departed {
            self.stop_target(&name).await;
            self.cache.remove(&name);
            info!(target_name = %name, "Removed target");
            summary.removed.push(name);
        }

        for (name, descriptor) in &configuration.targets {
            let request = configuration.request_for(descriptor).ok_or_else(|| {
                GatewayError::Config(format!("target {name} has no usable request"))
            })?;

            if let Some(existing) = self.targets.get(name) {
                let conn = &existing.connection;
                if conn.equal(descriptor) && conn.request() == request {
                    summary.kept.push(name.clone());
                    continue;
                }
                self.stop_target(name).await;
                info!(target_name = %name, "Target changed; restarting connection");
                summary.replaced.push(name.clone());
            } else {
                info!(target_name = %name, "Added target");
                summary.added.push(name.clone());
            }

            let sink: Arc<dyn TargetCacheSink> = self.cache.get_or_add(name);
            let connection = Arc::new(TargetConnection::new(
                self.settings,
                name.clone(),
                descriptor.clone(),
                sink,
                request.clone(),
                Arc::clone(&self.transport),
            ));
            self.start_target(connection);
        }

        debug!(
            added = summary.added.len(),
            replaced = summary.replaced.len(),
            removed = summary.removed.len(),
            kept = summary.kept.len(),
            "Applied target configuration"
        );
        Ok(summary)
    }

    fn start_target(&mut self, connection: Arc<TargetConnection>) {
        let name = connection.name().to_string();
        let lock = self.locks.lock_for(&name);
        let pool = Arc::clone(&self.pool);
        let conn = Arc::clone(&connection);
        let task = tokio::spawn(async move {
            if let Err(e) = conn.acquire_and_run(&pool, lock.as_ref()).await {
                error!(target_name = %conn.name(), error = %e, "Target connection loop failed");
            }
        });
        self.metrics.targets_started += 1;
        self.targets
            .insert(name, SupervisedTarget { connection, task });
    }

    async fn stop_target(&mut self, name: &str) {
        let Some(target) = self.targets.remove(name) else {
            return;
        };
        if let Err(e) = target.connection.disconnect() {
            warn!(target_name = %name, error = %e, "Failed to disconnect target");
        }
        self.join(name, target.task, self.shutdown_grace).await;
        self.metrics.targets_stopped += 1;
    }

    async fn join(&mut self, name: &str, mut task: JoinHandle<()>, grace: Duration) {
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target_name = %name, error = %e, "Target task ended abnormally"),
            Err(_) => {
                warn!(
                    target_name = %name,
                    grace = ?grace,
                    "Target task did not stop in time; aborting"
                );
                task.abort();
                self.metrics.tasks_aborted += 1;
            }
        }
    }

    /// Stop every target and wait for their tasks, sharing one grace period.
    pub async fn shutdown(&mut self) {
        info!(active_count = self.targets.len(), "Shutting down target supervisor");

        for (name, target) in &self.targets {
            if let Err(e) = target.connection.disconnect() {
                warn!(target_name = %name, error = %e, "Failed to disconnect target");
            }
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        let mut targets: Vec<(String, SupervisedTarget)> = self.targets.drain().collect();
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, target) in targets {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            self.join(&name, target.task, remaining).await;
            self.metrics.targets_stopped += 1;
        }
    }

    /// Names of supervised targets, sorted.
    #[must_use]
    pub fn targets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.keys().cloned().collect();
        names.sort();
        names
    }

    /// Connection for `name`, if supervised.
    #[must_use]
    pub fn connection(&self, name: &str) -> Option<Arc<TargetConnection>> {
        self.targets.get(name).map(|t| Arc::clone(&t.connection))
    }

    /// Status of every supervised target, sorted by name.
    #[must_use]
    pub fn status(&self) -> Vec<ConnectionStatus> {
        let mut status: Vec<ConnectionStatus> = self
            .targets
            .values()
            .map(|t| t.connection.status())
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }

    #[must_use]
    pub fn slot_stats(&self) -> SlotPoolStats {
        self.pool.stats()
    }

    #[must_use]
    pub fn metrics(&self) -> &SupervisorMetrics {
        &self.metrics
    }
}

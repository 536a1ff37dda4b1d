//! Lifecycle of the streaming subscription to one target.
//!
//! A [`TargetConnection`] is driven by [`TargetConnection::acquire_and_run`]
//! on its own task. The loop takes a slot from the shared
//! [`ConnectionSlotPool`], then the target's fleet [`LockGate`], and only
//! then dials. While the subscription lives, every inbound message is handled
//! inline: the first one marks the target connected, data updates are
//! filtered and forwarded to the [`TargetCacheSink`], and errors close the
//! subscription so the loop dials again.
//!
//! Stopping is cooperative. [`TargetConnection::disconnect`] marks the
//! connection stopped, wakes a sleeping loop and closes the live
//! subscription; the loop then tells the sink, releases the lock and the slot,
//! and returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::cache::TargetCacheSink;
use crate::error::{GatewayError, Result};
use crate::filter::{FilterOutcome, Rejection, RejectionScope, filter_notification};
use crate::lock::LockGate;
use crate::pool::{ConnectionSlotPool, SlotPermit};
use crate::proto::{Notification, Path, Response, SubscribeRequest, SubscribeResponse};
use crate::state::{ConnectionPhase, PhaseEvent};
use crate::target::TargetDescriptor;
use crate::transport::{CloseHandle, Query, TlsSettings, Transport, TransportEvent};

/// Knobs shared by every target connection of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Upper bound on a single dial.
    pub dial_timeout: Duration,
    /// Pause between failed slot/lock/dial attempts.
    pub retry_interval: Duration,
    pub tls: TlsSettings,
    pub rejection_scope: RejectionScope,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(50),
            tls: TlsSettings::default(),
            rejection_scope: RejectionScope::default(),
        }
    }
}

/// How a single `connect` attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A subscription was opened and has since closed.
    Established,
    /// No subscription was opened.
    Failed,
}

/// Read-only view of a connection for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub name: String,
    pub phase: ConnectionPhase,
    pub addresses: Vec<String>,
}

/// The connection to one configured target.
pub struct TargetConnection {
    name: String,
    descriptor: TargetDescriptor,
    request: SubscribeRequest,
    settings: ConnectionSettings,
    sink: Arc<dyn TargetCacheSink>,
    transport: Arc<dyn Transport>,
    phase: Mutex<ConnectionPhase>,
    client: Mutex<Option<CloseHandle>>,
    stop: Notify,
    running: AtomicBool,
}

impl std::fmt::Debug for TargetConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetConnection")
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl TargetConnection {
    #[must_use]
    pub fn new(
        settings: ConnectionSettings,
        name: impl Into<String>,
        descriptor: TargetDescriptor,
        sink: Arc<dyn TargetCacheSink>,
        request: SubscribeRequest,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            name: name.into(),
            descriptor,
            request,
            settings,
            sink,
            transport,
            phase: Mutex::new(ConnectionPhase::Idle),
            client: Mutex::new(None),
            stop: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn descriptor(&self) -> &TargetDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn request(&self) -> &SubscribeRequest {
        &self.request
    }

    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.lock()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.phase().is_connected()
    }

    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.phase().is_connecting()
    }

    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.phase().is_synced()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.phase().is_stopped()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            name: self.name.clone(),
            phase: self.phase(),
            addresses: self.descriptor.addresses.clone(),
        }
    }

    /// Whether `other` describes the same target identity.
    #[must_use]
    pub fn equal(&self, other: &TargetDescriptor) -> bool {
        self.descriptor.equal(other)
    }

    /// Apply `event` to the phase machine. Returns `(from, to)` if it applied.
    fn transition(&self, event: PhaseEvent) -> Option<(ConnectionPhase, ConnectionPhase)> {
        let mut phase = self.phase.lock();
        let from = *phase;
        let to = from.next(event)?;
        *phase = to;
        Some((from, to))
    }

    /// Hold a slot and the target lock, and keep a subscription open, until
    /// [`disconnect`](Self::disconnect) is called.
    ///
    /// Returns [`GatewayError::AlreadyRunning`] if another call is still
    /// running for this connection.
    pub async fn acquire_and_run(
        &self,
        pool: &ConnectionSlotPool,
        lock: &dyn LockGate,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(GatewayError::AlreadyRunning(self.name.clone()));
        }

        let mut slot: Option<SlotPermit> = None;
        let mut locked = false;

        while !self.is_stopped() {
            if slot.is_none() {
                slot = pool.try_acquire();
                if slot.is_some() {
                    debug!(target_name = %self.name, "Acquired connection slot");
                }
            }

            if slot.is_some() {
                if !locked {
                    locked = lock.try_acquire();
                    if locked {
                        info!(target_name = %self.name, "Acquired target lock");
                    }
                }
                if locked && self.connect().await == ConnectOutcome::Established {
                    continue;
                }
            }

            self.pause().await;
        }

        if let Some(slot) = slot.take() {
            pool.release(slot);
        }
        if locked {
            lock.unlock();
            info!(target_name = %self.name, "Released target lock");
        }
        self.running.store(false, Ordering::Release);
        info!(target_name = %self.name, "Target connection stopped");
        Ok(())
    }

    /// Sleep for the retry interval, or until stopped.
    async fn pause(&self) {
        let notified = self.stop.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        tokio::select! {
            () = &mut notified => {}
            () = tokio::time::sleep(self.settings.retry_interval) => {}
        }
    }

    /// Dial the target and consume the subscription until it closes.
    pub async fn connect(&self) -> ConnectOutcome {
        if self.transition(PhaseEvent::DialStarted).is_none() {
            return ConnectOutcome::Failed;
        }

        let query = match self.build_query() {
            Ok(query) => query,
            Err(e) => {
                error!(target_name = %self.name, error = %e, "Failed to build subscription query");
                self.disconnected();
                return ConnectOutcome::Failed;
            }
        };

        info!(
            target_name = %self.name,
            addresses = ?query.addresses,
            "Connecting to target"
        );

        // A stop must interrupt a dial that is still in flight.
        let stopped = self.stop.notified();
        tokio::pin!(stopped);
        stopped.as_mut().enable();
        if self.is_stopped() {
            self.disconnected();
            return ConnectOutcome::Failed;
        }

        let dial = tokio::time::timeout(
            self.settings.dial_timeout,
            self.transport.subscribe(query),
        );
        let dialed = tokio::select! {
            dialed = dial => dialed,
            () = &mut stopped => {
                debug!(target_name = %self.name, "Dial abandoned on stop");
                self.disconnected();
                return ConnectOutcome::Failed;
            }
        };
        let mut subscription = match dialed {
            Ok(Ok(subscription)) => subscription,
            Ok(Err(e)) => {
                warn!(target_name = %self.name, error = %e, "Subscribe failed");
                self.disconnected();
                return ConnectOutcome::Failed;
            }
            Err(_) => {
                let e = GatewayError::DialTimeout {
                    target: self.name.clone(),
                    timeout: self.settings.dial_timeout,
                };
                warn!(target_name = %self.name, error = %e, "Subscribe failed");
                self.disconnected();
                return ConnectOutcome::Failed;
            }
        };

        let handle = subscription.close_handle();
        *self.client.lock() = Some(handle.clone());
        // A disconnect that ran before the handle was stored could not close it.
        if self.is_stopped() {
            handle.close();
        }

        loop {
            match subscription.next_event().await {
                TransportEvent::Response(response) => {
                    if let Err(e) = self.handle_response(response) {
                        warn!(
                            target_name = %self.name,
                            error = %e,
                            "Closing subscription after response error"
                        );
                        handle.close();
                    }
                }
                TransportEvent::Closed(reason) => {
                    info!(target_name = %self.name, reason = %reason, "Subscription closed");
                    break;
                }
            }
        }

        self.client.lock().take();
        self.disconnected();
        ConnectOutcome::Established
    }

    fn build_query(&self) -> Result<Query> {
        let query = Query::build(
            &self.name,
            &self.descriptor,
            &self.request,
            self.settings.dial_timeout,
            self.settings.tls,
        )?;
        query.validate()?;
        Ok(query)
    }

    /// Stop the connection for good. Safe to call any number of times, from
    /// any task.
    #[allow(clippy::unnecessary_wraps)]
    pub fn disconnect(&self) -> Result<()> {
        if let Some((from, to)) = self.transition(PhaseEvent::StopRequested) {
            if from != to {
                info!(target_name = %self.name, phase = %from, "Stopping target connection");
            }
        }
        self.stop.notify_waiters();
        if let Some(handle) = self.client.lock().as_ref() {
            handle.close();
        }
        Ok(())
    }

    /// Drop the current subscription; the loop dials again without giving up
    /// its slot or lock.
    #[allow(clippy::unnecessary_wraps)]
    pub fn reconnect(&self) -> Result<()> {
        if let Some(handle) = self.client.lock().as_ref() {
            info!(target_name = %self.name, "Reconnecting to target");
            handle.close();
        }
        Ok(())
    }

    /// The subscription is gone. Withdraws the target from the cache if the
    /// cache had been told it was connected.
    fn disconnected(&self) {
        let Some((from, _)) = self.transition(PhaseEvent::TransportClosed) else {
            return;
        };
        if from.owns_cache_state() {
            info!(target_name = %self.name, "Target disconnected");
            self.sink.disconnect();
            self.sink.reset();
        }
    }

    /// Handle one inbound message. Errors mean the subscription should close.
    fn handle_response(&self, response: SubscribeResponse) -> Result<()> {
        if self.is_stopped() {
            return Ok(());
        }

        if self.transition(PhaseEvent::FirstMessage).is_some() {
            info!(target_name = %self.name, "Target connected");
            self.sink.connect();
        }

        match response.response {
            Some(Response::Update(notification)) => self.handle_update(notification),
            Some(Response::SyncResponse(_)) => {
                if self.transition(PhaseEvent::SyncReceived).is_some() {
                    debug!(target_name = %self.name, "Target synced");
                    self.sink.sync();
                }
                Ok(())
            }
            Some(Response::Error(err)) => Err(GatewayError::PeerError {
                target: self.name.clone(),
                message: err.to_string(),
            }),
            None => Err(GatewayError::UnrecognizedResponse(self.name.clone())),
        }
    }

    fn handle_update(&self, mut notification: Notification) -> Result<()> {
        let prefix = notification.prefix.get_or_insert_with(Path::default);
        if prefix.target.is_empty() {
            prefix.target.clone_from(&self.name);
        }

        match filter_notification(notification, self.settings.rejection_scope) {
            FilterOutcome::Forward {
                notification,
                rejected,
            } => {
                self.log_rejections(&rejected);
                self.sink.update(&notification)?;
            }
            FilterOutcome::Drop { rejected } => {
                self.log_rejections(&rejected);
            }
        }
        Ok(())
    }

    fn log_rejections(&self, rejected: &[Rejection]) {
        for reason in rejected {
            warn!(target_name = %self.name, reason = %reason, "Dropping malformed update");
        }
    }
}

//! Streaming subscription transport.
//!
//! The connection core dials through [`Transport::subscribe`] and then reads
//! [`TransportEvent`]s until it sees [`TransportEvent::Closed`]. A close
//! requested through the subscription's [`CloseHandle`] also ends in a
//! `Closed` event, so teardown always runs on the target's own task.
//!
//! [`LoopbackTransport`] is an in-process transport whose sessions are driven
//! by a [`LoopbackAcceptor`]; it stands in for a device in tests and demos.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::{GatewayError, Result};
use crate::proto::{SubscribeRequest, SubscribeResponse};
use crate::target::{Credentials, TargetDescriptor};

/// Capacity of a subscription's inbound buffer.
const EVENT_BUFFER: usize = 64;

/// TLS options for dialing a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Accept any server certificate.
    pub insecure_skip_verify: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            insecure_skip_verify: true,
        }
    }
}

/// Everything a transport needs to open one subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub target: String,
    pub addresses: Vec<String>,
    pub credentials: Option<Credentials>,
    pub timeout: Duration,
    pub tls: TlsSettings,
    pub request: SubscribeRequest,
}

impl Query {
    /// Build the query for `target` from its descriptor and request template.
    ///
    /// The request's prefix target is set to the target name unless the
    /// template already names one.
    pub fn build(
        target: &str,
        descriptor: &TargetDescriptor,
        request: &SubscribeRequest,
        timeout: Duration,
        tls: TlsSettings,
    ) -> Result<Self> {
        let mut request = request.clone();
        let Some(list) = request.subscribe.as_mut() else {
            return Err(GatewayError::InvalidRequest(format!(
                "request for {target} has no subscription list"
            )));
        };
        let prefix = list.prefix.get_or_insert_with(Default::default);
        if prefix.target.is_empty() {
            prefix.target = target.to_string();
        }

        Ok(Self {
            target: target.to_string(),
            addresses: descriptor.addresses.clone(),
            credentials: descriptor.credentials.clone(),
            timeout,
            tls,
            request,
        })
    }

    /// Reject queries no transport could dial.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| GatewayError::InvalidQuery {
            target: self.target.clone(),
            reason: reason.to_string(),
        };

        if self.target.is_empty() {
            return Err(invalid("target name is empty"));
        }
        if self.addresses.is_empty() {
            return Err(invalid("no addresses"));
        }
        if self.addresses.iter().any(|a| a.trim().is_empty()) {
            return Err(invalid("blank address"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("dial timeout is zero"));
        }
        match &self.request.subscribe {
            Some(list) if !list.subscription.is_empty() => Ok(()),
            Some(_) => Err(invalid("subscription list is empty")),
            None => Err(invalid("no subscription list")),
        }
    }
}

/// What a live subscription delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A message from the target.
    Response(SubscribeResponse),
    /// The subscription is over. No further events follow.
    Closed(String),
}

/// Requests the close of one subscription. Cheap to clone; `close` is
/// idempotent.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CloseHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseHandle {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// A live subscription.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::Receiver<TransportEvent>,
    close: CloseHandle,
    finished: bool,
}

impl Subscription {
    #[must_use]
    pub fn new(events: mpsc::Receiver<TransportEvent>, close: CloseHandle) -> Self {
        Self {
            events,
            close,
            finished: false,
        }
    }

    #[must_use]
    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Wait for the next event. After `Closed` has been returned, every
    /// further call returns `Closed` immediately.
    pub async fn next_event(&mut self) -> TransportEvent {
        if self.finished {
            return TransportEvent::Closed("subscription already closed".into());
        }

        let event = tokio::select! {
            biased;
            () = self.close.closed() => TransportEvent::Closed("closed locally".into()),
            event = self.events.recv() => match event {
                Some(event) => event,
                None => TransportEvent::Closed("stream ended".into()),
            },
        };

        if matches!(event, TransportEvent::Closed(_)) {
            self.finished = true;
            self.close.close();
        }
        event
    }
}

/// Opens subscriptions to targets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial the target and start the subscription described by `query`.
    async fn subscribe(&self, query: Query) -> Result<Subscription>;
}

/// Device side of one loopback subscription.
#[derive(Debug)]
pub struct LoopbackSession {
    pub query: Query,
    events: mpsc::Sender<TransportEvent>,
    close: CloseHandle,
}

impl LoopbackSession {
    /// Send a message to the subscriber. Returns false once the subscription
    /// is gone.
    pub async fn send(&self, response: SubscribeResponse) -> bool {
        !self.close.is_closed()
            && self
                .events
                .send(TransportEvent::Response(response))
                .await
                .is_ok()
    }

    /// End the subscription from the device side.
    pub async fn close(&self, reason: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Closed(reason.into())).await;
    }

    /// Whether the subscriber has closed the subscription.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    /// Wait until the subscriber closes the subscription.
    pub async fn closed(&self) {
        self.close.closed().await;
    }
}

/// Receives the sessions opened on a [`LoopbackTransport`].
#[derive(Debug)]
pub struct LoopbackAcceptor {
    sessions: mpsc::UnboundedReceiver<LoopbackSession>,
}

impl LoopbackAcceptor {
    /// Next dialed session, or `None` once the transport is dropped.
    pub async fn accept(&mut self) -> Option<LoopbackSession> {
        self.sessions.recv().await
    }

    /// A session that has already been dialed, if any.
    pub fn try_accept(&mut self) -> Option<LoopbackSession> {
        self.sessions.try_recv().ok()
    }
}

/// In-process transport.
#[derive(Debug)]
pub struct LoopbackTransport {
    sessions: mpsc::UnboundedSender<LoopbackSession>,
    dial_delay: Mutex<Option<Duration>>,
    failing_dials: AtomicUsize,
    dials: AtomicU64,
    queries: Mutex<Vec<Query>>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn channel() -> (Self, LoopbackAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            sessions: tx,
            dial_delay: Mutex::new(None),
            failing_dials: AtomicUsize::new(0),
            dials: AtomicU64::new(0),
            queries: Mutex::new(Vec::new()),
        };
        (transport, LoopbackAcceptor { sessions: rx })
    }

    /// Delay every dial by `delay` before it completes.
    pub fn set_dial_delay(&self, delay: Option<Duration>) {
        *self.dial_delay.lock() = delay;
    }

    /// Make the next `n` dials fail.
    pub fn fail_next_dials(&self, n: usize) {
        self.failing_dials.store(n, Ordering::SeqCst);
    }

    /// Number of dial attempts, successful or not.
    #[must_use]
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::SeqCst)
    }

    /// Queries of all dial attempts, oldest first.
    #[must_use]
    pub fn queries(&self) -> Vec<Query> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn subscribe(&self, query: Query) -> Result<Subscription> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().push(query.clone());

        let delay = *self.dial_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failing_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(GatewayError::Dial {
                target: query.target,
                reason: "connection refused".into(),
            });
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let close = CloseHandle::new();
        let session = LoopbackSession {
            query,
            events: tx,
            close: close.clone(),
        };
        self.sessions
            .send(session)
            .map_err(|_| GatewayError::Transport("loopback acceptor dropped".into()))?;
        Ok(Subscription::new(rx, close))
    }
}

//! Lifecycle phases of a target connection.
//!
//! ```text
//!            DialStarted           FirstMessage          SyncReceived
//!   Idle ───────────────▶ Connecting ─────────▶ Connected ──────────▶ Synced
//!                          ▲    │ TransportClosed   │ TransportClosed   │
//!              DialStarted │    ▼                   ▼                   │
//!                        Disconnected ◀─────────────┴───────────────────┘
//!
//!   StopRequested: Connected|Synced ─▶ Stopping ─(TransportClosed)─▶ Stopped
//!                  Idle|Connecting|Disconnected ─────────────────────▶ Stopped
//! ```
//!
//! `Stopping` and `Stopped` are terminal for the acquisition loop: nothing
//! leads back out of them.

use serde::{Deserialize, Serialize};

/// Where a target connection is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// Created; no dial attempted yet.
    #[default]
    Idle,
    /// Dialing or waiting for the first message.
    Connecting,
    /// At least one message received since the last (re)connect.
    Connected,
    /// The target reported its initial snapshot complete.
    Synced,
    /// The last subscription ended; the loop will retry.
    Disconnected,
    /// Stop requested while the cache still attributes state to the target.
    Stopping,
    /// Stopped for good.
    Stopped,
}

/// Inputs to the phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    DialStarted,
    FirstMessage,
    SyncReceived,
    TransportClosed,
    StopRequested,
}

impl ConnectionPhase {
    /// Next phase for `event`, or `None` if the event is not valid here.
    #[must_use]
    pub const fn next(self, event: PhaseEvent) -> Option<Self> {
        use ConnectionPhase as P;
        use PhaseEvent as E;

        match (self, event) {
            (P::Idle | P::Connecting | P::Disconnected, E::DialStarted) => Some(P::Connecting),
            (P::Connecting, E::FirstMessage) => Some(P::Connected),
            (P::Connected | P::Synced, E::SyncReceived) => Some(P::Synced),
            (P::Connecting | P::Connected | P::Synced | P::Disconnected, E::TransportClosed) => {
                Some(P::Disconnected)
            }
            (P::Stopping | P::Stopped, E::TransportClosed) => Some(P::Stopped),
            (P::Connected | P::Synced, E::StopRequested) => Some(P::Stopping),
            (P::Idle | P::Connecting | P::Disconnected, E::StopRequested) => Some(P::Stopped),
            (P::Stopping | P::Stopped, E::StopRequested) => Some(self),
            _ => None,
        }
    }

    /// At least one message received on the live subscription.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Synced)
    }

    /// The cache has been told `connect` and not yet `disconnect`.
    #[must_use]
    pub const fn owns_cache_state(self) -> bool {
        matches!(self, Self::Connected | Self::Synced | Self::Stopping)
    }

    /// Some part of the connection process has started and not been stopped.
    #[must_use]
    pub const fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Synced | Self::Disconnected
        )
    }

    #[must_use]
    pub const fn is_synced(self) -> bool {
        matches!(self, Self::Synced)
    }

    /// Disconnect has been requested.
    #[must_use]
    pub const fn is_stopped(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Synced => "synced",
            Self::Disconnected => "disconnected",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

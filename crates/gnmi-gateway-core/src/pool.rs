//! Connection slot pool.
//!
//! Bounds how many targets this process may be connecting to (or connected
//! to) at once. Every target's acquisition loop polls [`ConnectionSlotPool::try_acquire`]
//! and keeps the returned [`SlotPermit`] until it stops; dropping the permit
//! returns the slot. This keeps a mass reconnect after an outage or redeploy
//! from dialing every device at the same instant.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Statistics about slot usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotPoolStats {
    /// Configured number of slots.
    pub capacity: usize,
    /// Slots currently held.
    pub in_use: usize,
    /// Total successful acquisitions.
    pub total_acquired: u64,
    /// Total acquisition attempts that found no free slot.
    pub total_rejected: u64,
}

/// A held connection slot. The slot is released on drop.
#[derive(Debug)]
pub struct SlotPermit {
    _permit: OwnedSemaphorePermit,
}

/// Non-blocking counting admission gate shared by all target loops.
#[derive(Debug)]
pub struct ConnectionSlotPool {
    capacity: usize,
    semaphore: Arc<Semaphore>,
    total_acquired: AtomicU64,
    total_rejected: AtomicU64,
}

impl ConnectionSlotPool {
    /// Create a pool with `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
            total_acquired: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
        }
    }

    /// Take a slot if one is free. Never waits.
    pub fn try_acquire(&self) -> Option<SlotPermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => {
                self.total_acquired.fetch_add(1, Ordering::Relaxed);
                Some(SlotPermit { _permit: permit })
            }
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => {
                self.total_rejected.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Return a slot to the pool.
    pub fn release(&self, permit: SlotPermit) {
        drop(permit);
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    #[must_use]
    pub fn stats(&self) -> SlotPoolStats {
        SlotPoolStats {
            capacity: self.capacity,
            in_use: self.in_use(),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
        }
    }
}

//! Per-target fleet locks.
//!
//! A gateway instance only streams from a target while it holds that target's
//! lock, so redundant instances never double-subscribe. The core only needs
//! the non-blocking [`LockGate`] contract; two backends are provided:
//!
//! - [`LocalLockRegistry`]: in-process, for a single gateway or tests.
//! - [`FileLockProvider`]: OS-level file locks (via fs2) in a shared
//!   directory, one file per target. A sidecar metadata file records which
//!   process holds the lock for debugging.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from lock backends.
#[derive(Error, Debug)]
pub enum LockError {
    /// I/O error during lock operations.
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize/deserialize metadata.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Non-blocking mutual exclusion for one target identity.
///
/// Both operations are called from a polling loop and must return promptly.
pub trait LockGate: Send + Sync {
    /// Take the lock if nobody else in the fleet holds it.
    fn try_acquire(&self) -> bool;

    /// Release the lock. Safe to call more than once.
    fn unlock(&self);
}

/// Creates the lock gate for a target name.
pub trait LockProvider: Send + Sync {
    fn lock_for(&self, target: &str) -> Arc<dyn LockGate>;
}

/// In-process lock registry keyed by target name.
#[derive(Debug, Clone, Default)]
pub struct LocalLockRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl LocalLockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any handle currently holds `target`.
    #[must_use]
    pub fn is_held(&self, target: &str) -> bool {
        self.held.lock().contains(target)
    }

    /// Create a gate for `target` backed by this registry.
    #[must_use]
    pub fn gate(&self, target: &str) -> LocalLock {
        LocalLock {
            target: target.to_string(),
            registry: Arc::clone(&self.held),
            owned: AtomicBool::new(false),
        }
    }
}

impl LockProvider for LocalLockRegistry {
    fn lock_for(&self, target: &str) -> Arc<dyn LockGate> {
        Arc::new(self.gate(target))
    }
}

/// A handle on one target's lock in a [`LocalLockRegistry`].
#[derive(Debug)]
pub struct LocalLock {
    target: String,
    registry: Arc<Mutex<HashSet<String>>>,
    owned: AtomicBool,
}

impl LockGate for LocalLock {
    fn try_acquire(&self) -> bool {
        if self.owned.load(Ordering::Acquire) {
            return true;
        }
        let acquired = self.registry.lock().insert(self.target.clone());
        if acquired {
            self.owned.store(true, Ordering::Release);
            tracing::debug!(target_name = %self.target, "Acquired local target lock");
        }
        acquired
    }

    fn unlock(&self) {
        if self.owned.swap(false, Ordering::AcqRel) {
            self.registry.lock().remove(&self.target);
            tracing::debug!(target_name = %self.target, "Released local target lock");
        }
    }
}

impl Drop for LocalLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Diagnostic metadata written alongside a held lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    /// Process ID of the lock holder.
    pub pid: u32,
    /// Target the lock guards.
    pub target: String,
    /// Unix timestamp when the lock was acquired.
    pub acquired_at: u64,
    /// Version of the gateway that acquired the lock.
    pub gateway_version: String,
}

impl LockMetadata {
    fn new(target: &str) -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        Self {
            pid: std::process::id(),
            target: target.to_string(),
            acquired_at: now,
            gateway_version: crate::VERSION.to_string(),
        }
    }
}

/// File-lock backend: one lock file per target under `dir`.
///
/// Every gateway process pointing at the same directory competes for the same
/// files, so this works across processes on one host or a shared filesystem
/// with working `flock` semantics.
#[derive(Debug, Clone)]
pub struct FileLockProvider {
    dir: PathBuf,
}

impl FileLockProvider {
    /// Use `dir` for lock files, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LockError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Lock file path for `target`.
    #[must_use]
    pub fn lock_path(&self, target: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", sanitize(target)))
    }

    /// Gate for `target`.
    #[must_use]
    pub fn gate(&self, target: &str) -> FileLock {
        FileLock {
            target: target.to_string(),
            lock_path: self.lock_path(target),
            file: Mutex::new(None),
        }
    }

    /// Metadata of the current holder of `target`, if the lock is held.
    #[must_use]
    pub fn holder(&self, target: &str) -> Option<LockMetadata> {
        let lock_path = self.lock_path(target);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .open(&lock_path)
            .ok()?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                // Nothing was holding it; dropping the handle releases it again
                drop(lock_file);
                None
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                fs::read_to_string(metadata_path(&lock_path))
                    .ok()
                    .and_then(|s| serde_json::from_str(&s).ok())
            }
            Err(_) => None,
        }
    }
}

impl LockProvider for FileLockProvider {
    fn lock_for(&self, target: &str) -> Arc<dyn LockGate> {
        Arc::new(self.gate(target))
    }
}

/// A handle on one target's lock file.
#[derive(Debug)]
pub struct FileLock {
    target: String,
    lock_path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileLock {
    fn try_lock_file(&self) -> Result<Option<File>, LockError> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                self.write_metadata()?;
                Ok(Some(lock_file))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    fn write_metadata(&self) -> Result<(), LockError> {
        let metadata = LockMetadata::new(&self.target);
        let json = serde_json::to_string_pretty(&metadata)?;

        let mut file = File::create(metadata_path(&self.lock_path))?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }
}

impl LockGate for FileLock {
    fn try_acquire(&self) -> bool {
        let mut held = self.file.lock();
        if held.is_some() {
            return true;
        }
        match self.try_lock_file() {
            Ok(Some(file)) => {
                *held = Some(file);
                tracing::debug!(
                    target_name = %self.target,
                    lock_path = %self.lock_path.display(),
                    "Acquired target lock file"
                );
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(
                    target_name = %self.target,
                    lock_path = %self.lock_path.display(),
                    error = %e,
                    "Failed to take target lock file"
                );
                false
            }
        }
    }

    fn unlock(&self) {
        let Some(file) = self.file.lock().take() else {
            return;
        };
        let meta_path = metadata_path(&self.lock_path);
        if let Err(e) = fs::remove_file(&meta_path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    meta_path = %meta_path.display(),
                    error = %e,
                    "Failed to remove lock metadata"
                );
            }
        }
        if let Err(e) = FileExt::unlock(&file) {
            tracing::warn!(
                target_name = %self.target,
                error = %e,
                "Failed to unlock target lock file"
            );
        }
        tracing::debug!(target_name = %self.target, "Released target lock file");
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Compute the metadata sidecar path for a given lock path.
fn metadata_path(lock_path: &Path) -> PathBuf {
    let mut meta_path = lock_path.to_path_buf();
    let file_name = lock_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("lock");
    meta_path.set_file_name(format!("{file_name}.meta.json"));
    meta_path
}

fn sanitize(target: &str) -> String {
    target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

//! Per-target telemetry cache.
//!
//! The connection core only talks to [`TargetCacheSink`]. [`TargetCache`] is
//! the in-memory implementation: the latest value per leaf path plus the
//! connected/synced flags the gateway reports to its consumers. [`Cache`]
//! owns one `TargetCache` per target name.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proto::{Notification, Path, TypedValue};

/// Errors from applying a notification to a target cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// An update resolved to the root path.
    #[error("update has an empty path")]
    EmptyPath,

}

/// Receives the life-cycle and data of one target's subscription.
///
/// Calls for a target arrive from that target's task, in order. Implementations
/// must be safe to share because status readers may run concurrently.
pub trait TargetCacheSink: Send + Sync {
    /// The subscription delivered its first message.
    fn connect(&self);

    /// The subscription that was connected has ended.
    fn disconnect(&self);

    /// Discard everything learned from the ended subscription.
    fn reset(&self);

    /// The target finished sending its initial snapshot.
    fn sync(&self);

    /// Apply a data notification.
    fn update(&self, notification: &Notification) -> Result<(), CacheError>;
}

/// A cached leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    pub timestamp: i64,
    pub value: Option<TypedValue>,
}

#[derive(Debug, Default)]
struct TargetCacheState {
    connected: bool,
    synced: bool,
    values: BTreeMap<String, CachedValue>,
}

/// Snapshot of a target cache's flags and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetCacheStats {
    pub connected: bool,
    pub synced: bool,
    pub leaves: usize,
    pub updates: u64,
    pub connects: u64,
    pub disconnects: u64,
}

/// In-memory latest-value cache for one target.
#[derive(Debug)]
pub struct TargetCache {
    name: String,
    state: RwLock<TargetCacheState>,
    updates: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
}

impl TargetCache {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(TargetCacheState::default()),
            updates: AtomicU64::new(0),
            connects: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.state.read().synced
    }

    /// Latest value stored at `path` (rendered as `/a/b[k=v]`).
    #[must_use]
    pub fn get(&self, path: &str) -> Option<CachedValue> {
        self.state.read().values.get(path).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> TargetCacheStats {
        let state = self.state.read();
        TargetCacheStats {
            connected: state.connected,
            synced: state.synced,
            leaves: state.values.len(),
            updates: self.updates.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

impl TargetCacheSink for TargetCache {
    fn connect(&self) {
        self.state.write().connected = true;
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    fn disconnect(&self) {
        let mut state = self.state.write();
        state.connected = false;
        state.synced = false;
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        let mut state = self.state.write();
        state.values.clear();
        state.synced = false;
    }

    fn sync(&self) {
        self.state.write().synced = true;
    }

    fn update(&self, notification: &Notification) -> Result<(), CacheError> {
        // Devices may report their own hostname as the target designator.
        // Everything delivered here belongs to this cache regardless.
        if let Some(target) = notification.target().filter(|t| *t != self.name) {
            tracing::trace!(
                cache = %self.name,
                designator = %target,
                "Storing update with foreign target designator"
            );
        }

        let prefix = notification.prefix.clone().unwrap_or_default();

        // Validate everything before touching state so a bad notification
        // is applied all-or-nothing.
        let mut leaves = Vec::with_capacity(notification.update.len());
        for update in &notification.update {
            let full = prefix.join(&update.path);
            if full.is_empty() {
                return Err(CacheError::EmptyPath);
            }
            leaves.push((full.to_string(), update.val.clone()));
        }
        let deletes: Vec<String> = notification
            .delete
            .iter()
            .map(|d| prefix.join(d))
            .map(|p: Path| p.to_string())
            .collect();

        let mut state = self.state.write();
        for removed in &deletes {
            if removed == "/" {
                state.values.clear();
                continue;
            }
            let subtree = format!("{removed}/");
            state
                .values
                .retain(|key, _| key != removed && !key.starts_with(&subtree));
        }
        for (key, value) in leaves {
            state.values.insert(
                key,
                CachedValue {
                    timestamp: notification.timestamp,
                    value,
                },
            );
        }
        self.updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// All target caches of a gateway, keyed by target name.
#[derive(Debug, Default)]
pub struct Cache {
    targets: RwLock<HashMap<String, Arc<TargetCache>>>,
}

impl Cache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (replacing any previous) cache for `name`.
    pub fn add(&self, name: &str) -> Arc<TargetCache> {
        let target = Arc::new(TargetCache::new(name));
        self.targets
            .write()
            .insert(name.to_string(), Arc::clone(&target));
        target
    }

    /// Existing cache for `name`, or a new one.
    pub fn get_or_add(&self, name: &str) -> Arc<TargetCache> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        Arc::clone(
            self.targets
                .write()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(TargetCache::new(name))),
        )
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<TargetCache>> {
        self.targets.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<TargetCache>> {
        self.targets.write().remove(name)
    }

    /// Target names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{PathElem, Update};
    use pretty_assertions::assert_eq;

    fn notification(target: &str, updates: Vec<Update>) -> Notification {
        Notification {
            timestamp: 7,
            prefix: Some(Path::from_names(&["interfaces"]).with_target(target)),
            update: updates,
            ..Notification::default()
        }
    }

    fn counter(name: &str, value: u64) -> Update {
        Update::new(
            Path::new(vec![
                PathElem::new("interface").with_key("name", name),
                PathElem::new("state"),
                PathElem::new("in-octets"),
            ]),
            TypedValue::Uint(value),
        )
    }

    #[test]
    fn update_stores_leaf_under_joined_path() {
        let cache = TargetCache::new("edge1");
        cache
            .update(&notification("edge1", vec![counter("eth0", 42)]))
            .expect("update");

        assert_eq!(
            cache.get("/interfaces/interface[name=eth0]/state/in-octets"),
            Some(CachedValue {
                timestamp: 7,
                value: Some(TypedValue::Uint(42)),
            })
        );
    }

    #[test]
    fn update_keys_foreign_or_missing_target_under_this_cache() {
        let cache = TargetCache::new("edge1");
        cache
            .update(&notification("router-hostname", vec![counter("eth0", 1)]))
            .expect("foreign designator");
        let mut anonymous = notification("", vec![counter("eth1", 2)]);
        anonymous.prefix = Some(Path::from_names(&["interfaces"]));
        cache.update(&anonymous).expect("no designator");

        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache
                .get("/interfaces/interface[name=eth0]/state/in-octets")
                .and_then(|v| v.value),
            Some(TypedValue::Uint(1))
        );
    }

    #[test]
    fn update_rejects_root_path_without_partial_apply() {
        let cache = TargetCache::new("edge1");
        let n = Notification {
            prefix: Some(Path::default().with_target("edge1")),
            update: vec![
                Update::new(
                    Path::from_names(&["system", "hostname"]),
                    TypedValue::String("r1".into()),
                ),
                Update::new(Path::default(), TypedValue::Bool(true)),
            ],
            ..Notification::default()
        };
        assert_eq!(cache.update(&n), Err(CacheError::EmptyPath));
        assert!(cache.is_empty());
    }

    #[test]
    fn delete_removes_subtree() {
        let cache = TargetCache::new("edge1");
        cache
            .update(&notification(
                "edge1",
                vec![counter("eth0", 1), counter("eth1", 2)],
            ))
            .expect("update");
        assert_eq!(cache.len(), 2);

        let delete = Notification {
            prefix: Some(Path::from_names(&["interfaces"]).with_target("edge1")),
            delete: vec![Path::new(vec![
                PathElem::new("interface").with_key("name", "eth0"),
            ])],
            ..Notification::default()
        };
        cache.update(&delete).expect("delete");
        assert_eq!(cache.len(), 1);
        assert!(
            cache
                .get("/interfaces/interface[name=eth1]/state/in-octets")
                .is_some()
        );
    }

    #[test]
    fn lifecycle_flags_follow_sink_calls() {
        let cache = TargetCache::new("edge1");
        cache.connect();
        cache.sync();
        cache
            .update(&notification("edge1", vec![counter("eth0", 1)]))
            .expect("update");
        assert!(cache.is_connected() && cache.is_synced());

        cache.disconnect();
        cache.reset();
        let stats = cache.stats();
        assert_eq!(
            stats,
            TargetCacheStats {
                connected: false,
                synced: false,
                leaves: 0,
                updates: 1,
                connects: 1,
                disconnects: 1,
            }
        );
    }

    #[test]
    fn cache_registry_get_or_add_is_stable() {
        let cache = Cache::new();
        let a = cache.get_or_add("edge1");
        let b = cache.get_or_add("edge1");
        assert!(Arc::ptr_eq(&a, &b));

        cache.add("edge0");
        assert_eq!(cache.names(), vec!["edge0".to_string(), "edge1".to_string()]);

        assert!(cache.remove("edge1").is_some());
        assert!(cache.get("edge1").is_none());
    }
}

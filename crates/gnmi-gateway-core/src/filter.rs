//! Denylist for malformed paths reported by some device firmware.
//!
//! Certain implementations emit list entries whose key is the list's own name
//! (`/interfaces/interface[name=interface]`) or stream bogus top-level
//! containers. Such updates would corrupt the cache, so they are dropped
//! before forwarding. Dropping is not an error.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::proto::{Notification, Path};

/// Container/list pairs whose list entries must not be keyed by the list name.
const SELF_KEYED_LISTS: &[(&str, &str)] = &[
    ("interfaces", "interface"),
    ("network-instances", "network-instance"),
];

/// Top-level elements that are never valid telemetry.
const BOGUS_ROOTS: &[&str] = &["netconf-state"];

/// Why a path was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// A list entry keyed by the list element's own name.
    SelfKeyedList { container: &'static str },
    /// A path rooted at a known bogus container.
    BogusRoot { root: &'static str },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfKeyedList { container } => {
                write!(f, "self-keyed list entry under /{container}")
            }
            Self::BogusRoot { root } => write!(f, "bogus root /{root}"),
        }
    }
}

/// Whether rejection drops one update or the whole notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionScope {
    /// Drop offending updates and keep their well-formed siblings.
    #[default]
    Update,
    /// Drop the whole notification on the first offending update.
    Notification,
}

/// Check a single path against the denylist.
#[must_use]
pub fn check_path(path: &Path) -> Option<Rejection> {
    let elems = &path.elem;
    let first = elems.first()?;

    if let Some(root) = BOGUS_ROOTS.iter().copied().find(|r| first.name == *r) {
        return Some(Rejection::BogusRoot { root });
    }

    let second = elems.get(1)?;
    let self_key = second.key.get("name")?;
    SELF_KEYED_LISTS
        .iter()
        .copied()
        .find(|&(container, list)| {
            first.name == container && second.name == list && self_key == list
        })
        .map(|(container, _)| Rejection::SelfKeyedList { container })
}

/// Result of filtering a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    /// Forward this (possibly reduced) notification.
    Forward {
        notification: Notification,
        rejected: Vec<Rejection>,
    },
    /// Nothing left to forward.
    Drop { rejected: Vec<Rejection> },
}

/// Apply the denylist to every update of `notification`.
#[must_use]
pub fn filter_notification(mut notification: Notification, scope: RejectionScope) -> FilterOutcome {
    let mut rejected = Vec::new();

    match scope {
        RejectionScope::Notification => {
            if let Some(reason) = notification.update.iter().find_map(|u| check_path(&u.path)) {
                return FilterOutcome::Drop {
                    rejected: vec![reason],
                };
            }
        }
        RejectionScope::Update => {
            let had_updates = !notification.update.is_empty();
            notification.update.retain(|update| match check_path(&update.path) {
                Some(reason) => {
                    rejected.push(reason);
                    false
                }
                None => true,
            });
            if had_updates && notification.is_empty() {
                return FilterOutcome::Drop { rejected };
            }
        }
    }

    FilterOutcome::Forward {
        notification,
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{PathElem, TypedValue, Update};
    use proptest::prelude::*;

    fn keyed(container: &str, list: &str, key: &str) -> Path {
        Path::new(vec![
            PathElem::new(container),
            PathElem::new(list).with_key("name", key),
        ])
    }

    fn update(path: Path) -> Update {
        Update::new(path, TypedValue::Uint(1))
    }

    #[test]
    fn rejects_self_keyed_interface() {
        assert_eq!(
            check_path(&keyed("interfaces", "interface", "interface")),
            Some(Rejection::SelfKeyedList {
                container: "interfaces"
            })
        );
    }

    #[test]
    fn rejects_self_keyed_network_instance() {
        assert_eq!(
            check_path(&keyed(
                "network-instances",
                "network-instance",
                "network-instance"
            )),
            Some(Rejection::SelfKeyedList {
                container: "network-instances"
            })
        );
    }

    #[test]
    fn rejects_netconf_state_with_any_continuation() {
        assert!(check_path(&Path::from_names(&["netconf-state"])).is_some());
        assert!(check_path(&Path::from_names(&["netconf-state", "sessions", "session"])).is_some());
    }

    #[test]
    fn accepts_real_interface() {
        assert_eq!(check_path(&keyed("interfaces", "interface", "eth0")), None);
    }

    #[test]
    fn accepts_unkeyed_or_mismatched_pairs() {
        assert_eq!(check_path(&Path::from_names(&["interfaces", "interface"])), None);
        assert_eq!(check_path(&keyed("interfaces", "subinterface", "subinterface")), None);
        assert_eq!(check_path(&keyed("network-instances", "network-instance", "interface")), None);
        assert_eq!(check_path(&Path::default()), None);
    }

    #[test]
    fn update_scope_keeps_good_siblings() {
        let n = Notification {
            update: vec![
                update(keyed("interfaces", "interface", "interface")),
                update(keyed("interfaces", "interface", "eth0")),
            ],
            ..Notification::default()
        };
        match filter_notification(n, RejectionScope::Update) {
            FilterOutcome::Forward {
                notification,
                rejected,
            } => {
                assert_eq!(notification.update.len(), 1);
                assert_eq!(
                    notification.update[0].path,
                    keyed("interfaces", "interface", "eth0")
                );
                assert_eq!(rejected.len(), 1);
            }
            FilterOutcome::Drop { .. } => panic!("expected forward"),
        }
    }

    #[test]
    fn update_scope_drops_fully_rejected_notification() {
        let n = Notification {
            update: vec![update(Path::from_names(&["netconf-state", "capabilities"]))],
            ..Notification::default()
        };
        assert!(matches!(
            filter_notification(n, RejectionScope::Update),
            FilterOutcome::Drop { rejected } if rejected.len() == 1
        ));
    }

    #[test]
    fn update_scope_keeps_deletes_when_updates_rejected() {
        let n = Notification {
            update: vec![update(Path::from_names(&["netconf-state"]))],
            delete: vec![Path::from_names(&["interfaces"])],
            ..Notification::default()
        };
        assert!(matches!(
            filter_notification(n, RejectionScope::Update),
            FilterOutcome::Forward { notification, .. }
                if notification.update.is_empty() && notification.delete.len() == 1
        ));
    }

    #[test]
    fn notification_scope_drops_everything_on_first_match() {
        let n = Notification {
            update: vec![
                update(keyed("interfaces", "interface", "eth0")),
                update(keyed("interfaces", "interface", "interface")),
            ],
            ..Notification::default()
        };
        assert!(matches!(
            filter_notification(n, RejectionScope::Notification),
            FilterOutcome::Drop { .. }
        ));
    }

    #[test]
    fn clean_notification_passes_unchanged() {
        let n = Notification {
            timestamp: 42,
            update: vec![update(keyed("interfaces", "interface", "eth0"))],
            ..Notification::default()
        };
        for scope in [RejectionScope::Update, RejectionScope::Notification] {
            assert!(matches!(
                filter_notification(n.clone(), scope),
                FilterOutcome::Forward {
                    ref notification,
                    ref rejected,
                } if *notification == n && rejected.is_empty()
            ));
        }
    }

    proptest! {
        #[test]
        fn interface_keys_other_than_list_name_pass(key in "[a-zA-Z0-9/_-]{1,16}") {
            prop_assume!(key != "interface");
            prop_assert_eq!(check_path(&keyed("interfaces", "interface", &key)), None);
        }

        #[test]
        fn netconf_state_is_always_rejected(
            tail in proptest::collection::vec("[a-z-]{1,10}", 0..4),
        ) {
            let mut names = vec!["netconf-state".to_string()];
            names.extend(tail);
            let path = Path::new(names.into_iter().map(PathElem::new).collect());
            prop_assert!(check_path(&path).is_some());
        }
    }
}

//! gNMI message model.
//!
//! Only the parts of the Subscribe RPC that drive the connection state machine
//! are modelled here: paths, notifications, the subscribe request template and
//! the four response kinds a target can send.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One element of a gNMI path, with optional list keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathElem {
    /// Element name.
    pub name: String,
    /// List keys, if the element is a list entry.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub key: BTreeMap<String, String>,
}

impl PathElem {
    /// Create an element without keys.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: BTreeMap::new(),
        }
    }

    /// Add a list key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.key.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for PathElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for (k, v) in &self.key {
            write!(f, "[{k}={v}]")?;
        }
        Ok(())
    }
}

/// A gNMI path. `target` is the designator of the device the path belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    /// Schema origin.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,
    /// Path elements.
    #[serde(default)]
    pub elem: Vec<PathElem>,
    /// Target designator.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
}

impl Path {
    /// Create a path from its elements.
    #[must_use]
    pub fn new(elem: Vec<PathElem>) -> Self {
        Self {
            elem,
            ..Self::default()
        }
    }

    /// Create a path from plain element names.
    #[must_use]
    pub fn from_names(names: &[&str]) -> Self {
        Self::new(names.iter().map(|n| PathElem::new(*n)).collect())
    }

    /// Set the target designator.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Whether the path has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elem.is_empty()
    }

    /// Concatenate `self` (a prefix) with `suffix`.
    #[must_use]
    pub fn join(&self, suffix: &Self) -> Self {
        let mut elem = self.elem.clone();
        elem.extend(suffix.elem.iter().cloned());
        Self {
            origin: if suffix.origin.is_empty() {
                self.origin.clone()
            } else {
                suffix.origin.clone()
            },
            elem,
            target: self.target.clone(),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.origin.is_empty() {
            write!(f, "{}:", self.origin)?;
        }
        if self.elem.is_empty() {
            return f.write_str("/");
        }
        for elem in &self.elem {
            write!(f, "/{elem}")?;
        }
        Ok(())
    }
}

/// A leaf value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypedValue {
    String(String),
    Int(i64),
    Uint(u64),
    Bool(bool),
    Double(f64),
    Bytes(Vec<u8>),
    Json(String),
}

/// A single path/value pair inside a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// Path relative to the notification prefix.
    pub path: Path,
    /// New value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<TypedValue>,
    /// Number of coalesced duplicates.
    #[serde(default)]
    pub duplicates: u32,
}

impl Update {
    /// Create an update for `path` carrying `val`.
    #[must_use]
    pub fn new(path: Path, val: TypedValue) -> Self {
        Self {
            path,
            val: Some(val),
            duplicates: 0,
        }
    }
}

/// A timestamped batch of updates and deletes sharing a prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Nanoseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    /// Prefix shared by every path in the notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<Path>,
    /// Updated leaves.
    #[serde(default)]
    pub update: Vec<Update>,
    /// Deleted paths.
    #[serde(default)]
    pub delete: Vec<Path>,
    /// Whether the notification must be applied atomically.
    #[serde(default)]
    pub atomic: bool,
}

impl Notification {
    /// Target designator from the prefix, if any.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.prefix
            .as_ref()
            .map(|p| p.target.as_str())
            .filter(|t| !t.is_empty())
    }

    /// Whether the notification carries neither updates nor deletes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.update.is_empty() && self.delete.is_empty()
    }
}

/// Error payload sent by a target in place of data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Status code.
    #[serde(default)]
    pub code: u32,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code {}: {}", self.code, self.message)
    }
}

/// Payload of a subscribe response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    /// Data update.
    Update(Notification),
    /// Initial state snapshot complete.
    SyncResponse(bool),
    /// Explicit error.
    Error(ErrorMessage),
}

/// A message received on a Subscribe stream.
///
/// `response` is `None` when the peer sent a payload this gateway does not
/// understand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
}

impl SubscribeResponse {
    /// Wrap a notification.
    #[must_use]
    pub fn update(notification: Notification) -> Self {
        Self {
            response: Some(Response::Update(notification)),
        }
    }

    /// Sync marker.
    #[must_use]
    pub fn sync() -> Self {
        Self {
            response: Some(Response::SyncResponse(true)),
        }
    }

    /// Error payload.
    #[must_use]
    pub fn error(code: u32, message: impl Into<String>) -> Self {
        Self {
            response: Some(Response::Error(ErrorMessage {
                code,
                message: message.into(),
            })),
        }
    }
}

/// How the target should stream a subscription list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListMode {
    #[default]
    Stream,
    Once,
    Poll,
}

/// Per-path streaming mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    #[default]
    TargetDefined,
    OnChange,
    Sample,
}

/// Value encoding requested from the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Json,
    Bytes,
    Proto,
    Ascii,
    JsonIetf,
}

/// One subscribed path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub path: Path,
    #[serde(default)]
    pub mode: SubscriptionMode,
    /// Sample interval in nanoseconds.
    #[serde(default)]
    pub sample_interval: u64,
    #[serde(default)]
    pub suppress_redundant: bool,
    /// Heartbeat interval in nanoseconds.
    #[serde(default)]
    pub heartbeat_interval: u64,
}

/// The subscription list carried by a subscribe request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<Path>,
    #[serde(default)]
    pub subscription: Vec<Subscription>,
    #[serde(default)]
    pub mode: ListMode,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default)]
    pub updates_only: bool,
}

/// Subscribe request template.
///
/// `subscribe` is `None` for requests that carry a poll or aliases instead of a
/// subscription list; those cannot be used to open a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscriptionList>,
}

impl SubscribeRequest {
    /// Stream request for the given paths with default modes.
    #[must_use]
    pub fn stream(paths: Vec<Path>) -> Self {
        Self {
            subscribe: Some(SubscriptionList {
                subscription: paths
                    .into_iter()
                    .map(|path| Subscription {
                        path,
                        ..Subscription::default()
                    })
                    .collect(),
                ..SubscriptionList::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_display_includes_keys_and_origin() {
        let mut path = Path::new(vec![
            PathElem::new("interfaces"),
            PathElem::new("interface").with_key("name", "eth0"),
            PathElem::new("state"),
        ]);
        assert_eq!(path.to_string(), "/interfaces/interface[name=eth0]/state");
        path.origin = "openconfig".into();
        assert_eq!(
            path.to_string(),
            "openconfig:/interfaces/interface[name=eth0]/state"
        );
        assert_eq!(Path::default().to_string(), "/");
    }

    #[test]
    fn join_keeps_prefix_target() {
        let prefix = Path::from_names(&["interfaces"]).with_target("edge1");
        let joined = prefix.join(&Path::from_names(&["interface", "state"]));
        assert_eq!(joined.target, "edge1");
        assert_eq!(joined.elem.len(), 3);
    }

    #[test]
    fn notification_target_ignores_empty_designator() {
        let mut n = Notification {
            prefix: Some(Path::default()),
            ..Notification::default()
        };
        assert_eq!(n.target(), None);
        n.prefix = Some(Path::default().with_target("edge1"));
        assert_eq!(n.target(), Some("edge1"));
    }

    #[test]
    fn subscribe_request_parses_from_toml() {
        let raw = r#"
            [subscribe]
            mode = "stream"
            encoding = "json_ietf"

            [[subscribe.subscription]]
            mode = "sample"
            sample_interval = 10000000000

            [[subscribe.subscription.path.elem]]
            name = "interfaces"
        "#;
        let req: SubscribeRequest = toml::from_str(raw).expect("parse");
        let list = req.subscribe.expect("subscription list");
        assert_eq!(list.encoding, Encoding::JsonIetf);
        assert_eq!(list.subscription[0].mode, SubscriptionMode::Sample);
        assert_eq!(list.subscription[0].path.elem[0].name, "interfaces");
    }

    #[test]
    fn unrecognized_response_deserializes_as_none() {
        let resp: SubscribeResponse = serde_json::from_str("{}").expect("parse");
        assert!(resp.response.is_none());
    }
}

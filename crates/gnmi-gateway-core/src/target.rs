//! Target identities and the target configuration document.
//!
//! A [`TargetConfiguration`] maps target names to [`TargetDescriptor`]s and
//! names the subscribe request templates they use. The supervisor compares
//! descriptors with [`TargetDescriptor::equal`] to decide whether a
//! configuration change needs a new connection.

use std::collections::BTreeMap;
use std::path::Path as FsPath;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::proto::SubscribeRequest;

/// Username/password presented to a target.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How to reach one target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Dial addresses, tried in order.
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Name of the subscribe request template in the configuration.
    #[serde(default)]
    pub request: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

impl TargetDescriptor {
    #[must_use]
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn with_request(mut self, request: impl Into<String>) -> Self {
        self.request = request.into();
        self
    }

    /// Identity equality: same addresses in the same order and identical
    /// credentials. `request` and `meta` are not part of the identity.
    #[must_use]
    pub fn equal(&self, other: &Self) -> bool {
        self.addresses == other.addresses && self.credentials == other.credentials
    }
}

/// All targets this gateway should serve, and the request templates they use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfiguration {
    #[serde(default)]
    pub targets: BTreeMap<String, TargetDescriptor>,
    #[serde(default)]
    pub requests: BTreeMap<String, SubscribeRequest>,
}

impl TargetConfiguration {
    /// Load from a `.json` or `.toml` file.
    pub fn load(path: &FsPath) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&raw)?,
            _ => toml::from_str(&raw)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Request template for a target.
    #[must_use]
    pub fn request_for(&self, descriptor: &TargetDescriptor) -> Option<&SubscribeRequest> {
        self.requests.get(&descriptor.request)
    }

    /// Check that every target is dialable and names a usable request.
    pub fn validate(&self) -> Result<()> {
        for (name, target) in &self.targets {
            if name.trim().is_empty() {
                return Err(GatewayError::Config("target name cannot be empty".into()));
            }
            if target.addresses.is_empty() || target.addresses.iter().any(|a| a.trim().is_empty())
            {
                return Err(GatewayError::Config(format!(
                    "target {name} needs at least one non-empty address"
                )));
            }
            let Some(request) = self.requests.get(&target.request) else {
                return Err(GatewayError::Config(format!(
                    "target {name} references unknown request {:?}",
                    target.request
                )));
            };
            if request.subscribe.is_none() {
                return Err(GatewayError::Config(format!(
                    "request {:?} used by target {name} has no subscription list",
                    target.request
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Path;
    use proptest::prelude::*;

    fn descriptor(addrs: &[&str], creds: Option<(&str, &str)>) -> TargetDescriptor {
        TargetDescriptor {
            addresses: addrs.iter().map(ToString::to_string).collect(),
            credentials: creds.map(|(u, p)| Credentials::new(u, p)),
            ..TargetDescriptor::default()
        }
    }

    #[test]
    fn equal_requires_same_address_order() {
        let a = descriptor(&["10.0.0.1:9339", "10.0.0.2:9339"], None);
        let b = descriptor(&["10.0.0.2:9339", "10.0.0.1:9339"], None);
        assert!(a.equal(&a.clone()));
        assert!(!a.equal(&b));
    }

    #[test]
    fn equal_checks_address_count() {
        let a = descriptor(&["10.0.0.1:9339"], None);
        let b = descriptor(&["10.0.0.1:9339", "10.0.0.2:9339"], None);
        assert!(!a.equal(&b));
        assert!(!b.equal(&a));
    }

    #[test]
    fn equal_checks_credentials() {
        let base = descriptor(&["a:1"], Some(("admin", "secret")));
        assert!(base.equal(&descriptor(&["a:1"], Some(("admin", "secret")))));
        assert!(!base.equal(&descriptor(&["a:1"], Some(("admin", "other")))));
        assert!(!base.equal(&descriptor(&["a:1"], Some(("root", "secret")))));
    }

    #[test]
    fn equal_treats_credential_presence_asymmetry_as_inequality() {
        let with = descriptor(&["a:1"], Some(("", "")));
        let without = descriptor(&["a:1"], None);
        assert!(!with.equal(&without));
        assert!(!without.equal(&with));
        assert!(without.equal(&descriptor(&["a:1"], None)));
    }

    #[test]
    fn equal_ignores_request_and_meta() {
        let a = descriptor(&["a:1"], None).with_request("interfaces");
        let mut b = descriptor(&["a:1"], None).with_request("bgp");
        b.meta.insert("site".into(), "sjc".into());
        assert!(a.equal(&b));
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let rendered = format!("{:?}", Credentials::new("admin", "hunter2"));
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }

    fn sample_configuration() -> TargetConfiguration {
        let mut config = TargetConfiguration::default();
        config.requests.insert(
            "default".into(),
            SubscribeRequest::stream(vec![Path::from_names(&["interfaces"])]),
        );
        config.targets.insert(
            "edge1".into(),
            descriptor(&["10.0.0.1:9339"], None).with_request("default"),
        );
        config
    }

    #[test]
    fn validate_accepts_well_formed_configuration() {
        sample_configuration().validate().expect("valid");
    }

    #[test]
    fn validate_rejects_unknown_request() {
        let mut config = sample_configuration();
        config
            .targets
            .get_mut("edge1")
            .expect("edge1")
            .request = "missing".into();
        let err = config.validate().expect_err("should fail");
        assert!(err.to_string().contains("unknown request"));
    }

    #[test]
    fn validate_rejects_blank_address() {
        let mut config = sample_configuration();
        config
            .targets
            .insert("edge2".into(), descriptor(&[" "], None).with_request("default"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_request_without_subscription_list() {
        let mut config = sample_configuration();
        config
            .requests
            .insert("default".into(), SubscribeRequest::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reads_json_and_toml() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = sample_configuration();

        let json_path = dir.path().join("targets.json");
        std::fs::write(&json_path, serde_json::to_string(&config).expect("json")).expect("write");
        assert_eq!(TargetConfiguration::load(&json_path).expect("load json"), config);

        let toml_path = dir.path().join("targets.toml");
        std::fs::write(
            &toml_path,
            r#"
            [targets.edge1]
            addresses = ["10.0.0.1:9339"]
            request = "default"

            [requests.default.subscribe]
            [[requests.default.subscribe.subscription]]
            [[requests.default.subscribe.subscription.path.elem]]
            name = "interfaces"
            "#,
        )
        .expect("write");
        assert_eq!(TargetConfiguration::load(&toml_path).expect("load toml"), config);
    }

    proptest! {
        #[test]
        fn equal_is_reflexive_and_symmetric(
            addrs in proptest::collection::vec("[a-z0-9.:]{1,12}", 1..4),
            other in proptest::collection::vec("[a-z0-9.:]{1,12}", 1..4),
            user in proptest::option::of("[a-z]{0,6}"),
        ) {
            let creds = user.map(|u| Credentials::new(u.clone(), u));
            let a = TargetDescriptor {
                addresses: addrs.clone(),
                credentials: creds.clone(),
                ..TargetDescriptor::default()
            };
            let b = TargetDescriptor {
                addresses: other.clone(),
                credentials: creds,
                ..TargetDescriptor::default()
            };
            prop_assert!(a.equal(&a.clone()));
            prop_assert_eq!(a.equal(&b), b.equal(&a));
            prop_assert_eq!(a.equal(&b), addrs == other);
        }

        #[test]
        fn reversing_distinct_addresses_breaks_equality(
            addrs in proptest::collection::btree_set("[a-z]{1,8}", 2..5),
        ) {
            let forward: Vec<String> = addrs.into_iter().collect();
            let mut reversed = forward.clone();
            reversed.reverse();
            let a = TargetDescriptor::new(forward);
            let b = TargetDescriptor::new(reversed);
            prop_assert!(!a.equal(&b));
        }
    }
}

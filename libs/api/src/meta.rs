//! Object metadata, owner references and object keys.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::KeyError;

/// Unique identity assigned by the object store at creation time.
///
/// Two objects with the same namespace and name but different UIDs are
/// different objects (one was deleted and the other recreated).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    /// Generate a fresh random UID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the UID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if no UID has been assigned.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Uid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Uid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference from a child object to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: Uid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_owner_deletion: Option<bool>,
}

impl OwnerReference {
    /// Build a controller reference (`controller=true`, `blockOwnerDeletion=true`)
    /// pointing at `owner`.
    pub fn controller_for<K: Resource>(owner: &K) -> Self {
        let meta = owner.meta();
        Self {
            api_version: K::API_VERSION.to_string(),
            kind: K::KIND.to_string(),
            name: meta.name.clone(),
            uid: meta.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Returns true if this reference marks the managing controller.
    pub fn is_controller(&self) -> bool {
        self.controller == Some(true)
    }
}

/// Standard object metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generate_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Uid::is_empty")]
    pub uid: Uid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub generation: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl ObjectMeta {
    /// Metadata with only namespace and name set.
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns true once the store has accepted a delete for this object.
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Returns true if `finalizer` is present.
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// The finalizer list with `finalizer` removed.
    pub fn finalizers_without(&self, finalizer: &str) -> Vec<String> {
        self.finalizers
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect()
    }

    /// The controller reference, if any.
    pub fn controller_ref(&self) -> Option<&OwnerReference> {
        controller_of(self)
    }

    /// Namespaced key of this object.
    pub fn key(&self) -> String {
        namespaced_key(&self.namespace, &self.name)
    }
}

/// Returns the owner reference with `controller=true`, if any.
///
/// References with `controller` unset or false never grant ownership.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references.iter().find(|r| r.is_controller())
}

/// Build the `namespace/name` key used by caches and the work queue.
pub fn namespaced_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Split a key produced by [`namespaced_key`] back into `(namespace, name)`.
pub fn split_key(key: &str) -> Result<(&str, &str), KeyError> {
    if key.is_empty() {
        return Err(KeyError::Empty);
    }
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) => Ok(("", name)),
        (Some(ns), Some(name), None) if !name.is_empty() => Ok((ns, name)),
        _ => Err(KeyError::InvalidFormat(key.to_string())),
    }
}

/// An object kind served by the object store.
pub trait Resource:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// `group/version` of the kind.
    const API_VERSION: &'static str;
    /// Kind name, e.g. `VirtualMachine`.
    const KIND: &'static str;
    /// Lowercase plural used in request paths.
    const PLURAL: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Namespaced key of this object.
    fn key(&self) -> String {
        self.meta().key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(uid: &str, controller: Option<bool>) -> OwnerReference {
        OwnerReference {
            api_version: "pool.vmfleet.io/v1alpha1".to_string(),
            kind: "VirtualMachinePool".to_string(),
            name: "pool".to_string(),
            uid: Uid::from(uid),
            controller,
            block_owner_deletion: None,
        }
    }

    #[test]
    fn test_key_roundtrip() {
        assert_eq!(namespaced_key("default", "vm-0"), "default/vm-0");
        assert_eq!(split_key("default/vm-0").unwrap(), ("default", "vm-0"));
        assert_eq!(split_key("cluster-scoped").unwrap(), ("", "cluster-scoped"));
    }

    #[test]
    fn test_split_key_rejects_malformed() {
        assert_eq!(split_key(""), Err(KeyError::Empty));
        assert!(split_key("a/b/c").is_err());
        assert!(split_key("ns/").is_err());
    }

    #[test]
    fn test_controller_of_ignores_non_controller_refs() {
        let mut meta = ObjectMeta::named("default", "vm-0");
        meta.owner_references = vec![owner("a", None), owner("b", Some(false))];
        assert!(controller_of(&meta).is_none());

        meta.owner_references.push(owner("c", Some(true)));
        assert_eq!(controller_of(&meta).unwrap().uid.as_str(), "c");
    }

    #[test]
    fn test_finalizers_without() {
        let mut meta = ObjectMeta::named("default", "vm-0");
        meta.finalizers = vec!["a".to_string(), "b".to_string()];
        assert!(meta.has_finalizer("a"));
        assert_eq!(meta.finalizers_without("a"), vec!["b".to_string()]);
    }

    #[test]
    fn test_meta_serializes_camel_case_and_skips_empty() {
        let mut meta = ObjectMeta::named("default", "vm-0");
        meta.owner_references.push(owner("u1", Some(true)));
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["ownerReferences"][0]["uid"], "u1");
        assert_eq!(json["ownerReferences"][0]["apiVersion"], "pool.vmfleet.io/v1alpha1");
        assert!(json.get("finalizers").is_none());
        assert!(json.get("labels").is_none());
    }
}

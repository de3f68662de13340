//! Patch bodies issued against the object store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use vmfleet_api::{OwnerReference, Uid};

/// One RFC 6902 operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Test { path: String, value: Value },
    Replace { path: String, value: Value },
    Add { path: String, value: Value },
    Remove { path: String },
}

/// A patch in one of the two encodings the controllers use.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// RFC 7386 merge patch.
    Merge(Value),
    /// RFC 6902 JSON patch; applied atomically, failing on a `test` mismatch.
    Json(Vec<PatchOp>),
}

impl Patch {
    /// HTTP `Content-Type` for this encoding.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Merge(_) => "application/merge-patch+json",
            Self::Json(_) => "application/json-patch+json",
        }
    }

    /// Serialized request body.
    pub fn to_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Merge(value) => serde_json::to_vec(value),
            Self::Json(ops) => serde_json::to_vec(ops),
        }
    }
}

fn owner_ref_value(owner: &OwnerReference) -> Value {
    let mut obj = Map::new();
    obj.insert("apiVersion".into(), Value::String(owner.api_version.clone()));
    obj.insert("kind".into(), Value::String(owner.kind.clone()));
    obj.insert("name".into(), Value::String(owner.name.clone()));
    obj.insert("uid".into(), Value::String(owner.uid.to_string()));
    obj.insert("controller".into(), Value::Bool(true));
    obj.insert("blockOwnerDeletion".into(), Value::Bool(true));
    Value::Object(obj)
}

fn string_list(items: &[String]) -> Value {
    if items.is_empty() {
        Value::Null
    } else {
        Value::Array(items.iter().cloned().map(Value::String).collect())
    }
}

fn string_map(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Merge patch making `owner` the controller of the child with `child_uid`.
///
/// Carrying the child UID makes the store reject the patch if the name now
/// belongs to a different object.
pub fn adopt_patch(owner: &OwnerReference, child_uid: &Uid) -> Patch {
    Patch::Merge(json!({
        "metadata": {
            "ownerReferences": [owner_ref_value(owner)],
            "uid": child_uid.as_str(),
        }
    }))
}

/// Merge patch clearing all owner references.
pub fn release_patch() -> Patch {
    Patch::Merge(json!({"metadata": {"ownerReferences": []}}))
}

/// Compare-and-swap of the finalizer list.
///
/// An empty old list tests for an absent field and adds it.
pub fn finalizer_patch(old: &[String], new: &[String]) -> Patch {
    let path = "/metadata/finalizers".to_string();
    let value = Value::Array(new.iter().cloned().map(Value::String).collect());
    let write = if old.is_empty() {
        PatchOp::Add {
            path: path.clone(),
            value,
        }
    } else {
        PatchOp::Replace {
            path: path.clone(),
            value,
        }
    };
    Patch::Json(vec![
        PatchOp::Test {
            path,
            value: string_list(old),
        },
        write,
    ])
}

/// Replace the label map, guarded by a `test` of the old one.
///
/// An object without labels has no map to test against, so the map is added.
pub fn label_patch(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Patch {
    if old.is_empty() {
        return Patch::Json(vec![PatchOp::Add {
            path: "/metadata/labels".into(),
            value: string_map(new),
        }]);
    }
    Patch::Json(vec![
        PatchOp::Test {
            path: "/metadata/labels".into(),
            value: string_map(old),
        },
        PatchOp::Replace {
            path: "/metadata/labels".into(),
            value: string_map(new),
        },
    ])
}

//! `ControllerRevision`: an immutable snapshot of a fleet spec.

use serde::{Deserialize, Serialize};

use crate::macros::impl_resource;
use crate::ObjectMeta;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRevision {
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// JSON snapshot of the owning fleet's spec.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Generation of the fleet the snapshot was taken at.
    #[serde(default)]
    pub revision: i64,
}

impl_resource!(ControllerRevision, "apps/v1", "ControllerRevision", "controllerrevisions");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PoolSpec, Resource};

    #[test]
    fn test_snapshot_roundtrips_pool_spec() {
        let spec = PoolSpec {
            replicas: Some(4),
            ..Default::default()
        };
        let rev = ControllerRevision {
            metadata: ObjectMeta::named("default", "web-3"),
            data: serde_json::to_value(&spec).unwrap(),
            revision: 3,
        };
        let back: PoolSpec = serde_json::from_value(rev.data.clone()).unwrap();
        assert_eq!(back, spec);
        assert_eq!(rev.key(), "default/web-3");
        assert_eq!(ControllerRevision::PLURAL, "controllerrevisions");
    }
}

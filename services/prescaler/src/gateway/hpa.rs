//! HorizontalPodAutoscaler across API versions.
//!
//! Servers expose HPAs under `autoscaling/v1`, `v2beta1`, `v2beta2` and
//! `v2`. The fields read here share one shape across all of them, so
//! everything past this module sees one [`HorizontalPodAutoscaler`].

use std::fmt;

use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::GatewayError;

/// Replica floor applied when a target does not request one.
pub const MINIMUM_REPLICAS: i32 = 1;

/// Supported `autoscaling` API versions, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HpaVersion {
    V1,
    V2beta1,
    V2beta2,
    V2,
}

impl HpaVersion {
    pub const GROUP: &'static str = "autoscaling";

    pub fn version(&self) -> &'static str {
        match self {
            HpaVersion::V1 => "v1",
            HpaVersion::V2beta1 => "v2beta1",
            HpaVersion::V2beta2 => "v2beta2",
            HpaVersion::V2 => "v2",
        }
    }

    pub fn api_version(&self) -> String {
        format!("{}/{}", Self::GROUP, self.version())
    }

    /// Accepts `v2beta2` or `autoscaling/v2beta2`.
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let version = raw
            .trim()
            .strip_prefix("autoscaling/")
            .unwrap_or_else(|| raw.trim());
        match version {
            "v1" => Ok(HpaVersion::V1),
            "v2beta1" => Ok(HpaVersion::V2beta1),
            "v2beta2" => Ok(HpaVersion::V2beta2),
            "v2" => Ok(HpaVersion::V2),
            _ => Err(GatewayError::UnknownHpaVersion(raw.to_string())),
        }
    }

    /// Picks the newest supported version out of what a server offers.
    pub fn latest_of<'a>(offered: impl IntoIterator<Item = &'a str>) -> Result<Self, GatewayError> {
        offered
            .into_iter()
            .filter_map(|v| HpaVersion::parse(v).ok())
            .max()
            .ok_or_else(|| GatewayError::UnknownHpaVersion("no supported autoscaling version".to_string()))
    }

    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(Self::GROUP, self.version(), "HorizontalPodAutoscaler");
        ApiResource::from_gvk(&gvk)
    }
}

impl fmt::Display for HpaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Self::GROUP, self.version())
    }
}

/// What an HPA scales.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
}

impl ScaleTargetRef {
    /// Name of the `apps/v1` Deployment this ref points at. Any other kind
    /// cannot be resolved.
    pub fn deployment_name(&self) -> Result<&str, GatewayError> {
        if self.api_version == "apps/v1" && self.kind == "Deployment" && !self.name.is_empty() {
            Ok(&self.name)
        } else {
            Err(GatewayError::TargetRefUnresolvable {
                api_version: self.api_version.clone(),
                kind: self.kind.clone(),
                name: self.name.clone(),
            })
        }
    }
}

/// Version-independent view of an HPA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizontalPodAutoscaler {
    pub version: HpaVersion,
    pub name: String,
    pub namespace: String,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub current_replicas: i32,
    pub desired_replicas: i32,
    pub scale_target_ref: ScaleTargetRef,
}

impl HorizontalPodAutoscaler {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Decodes a dynamic object fetched under `version`.
    pub fn from_dynamic(version: HpaVersion, obj: &DynamicObject) -> Result<Self, GatewayError> {
        let wire: HpaWire = serde_json::from_value(obj.data.clone())
            .map_err(|source| GatewayError::Decode { kind: "hpa", source })?;

        Ok(Self {
            version,
            name: obj.metadata.name.clone().unwrap_or_default(),
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            min_replicas: wire.spec.min_replicas.unwrap_or(MINIMUM_REPLICAS),
            max_replicas: wire.spec.max_replicas,
            current_replicas: wire.status.current_replicas,
            desired_replicas: wire.status.desired_replicas,
            scale_target_ref: wire.spec.scale_target_ref,
        })
    }
}

/// Fields every supported version shares.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HpaWire {
    #[serde(default)]
    spec: SpecWire,
    #[serde(default)]
    status: StatusWire,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpecWire {
    min_replicas: Option<i32>,
    #[serde(default)]
    max_replicas: i32,
    #[serde(default)]
    scale_target_ref: ScaleTargetRef,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusWire {
    #[serde(default)]
    current_replicas: i32,
    #[serde(default)]
    desired_replicas: i32,
}

/// Writes new bounds into a dynamic HPA body.
pub fn apply_override(data: &mut Value, min_replicas: Option<i32>, max_replicas: i32) {
    if !data.get("spec").is_some_and(Value::is_object) {
        data["spec"] = Value::Object(Default::default());
    }
    let spec = &mut data["spec"];
    spec["minReplicas"] = Value::from(min_replicas.unwrap_or(MINIMUM_REPLICAS));
    spec["maxReplicas"] = Value::from(max_replicas);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn dynamic(version: HpaVersion, body: Value) -> DynamicObject {
        let mut obj = DynamicObject::new("web", &version.api_resource()).within("shop");
        obj.data = body;
        obj
    }

    #[rstest]
    #[case("v1", HpaVersion::V1)]
    #[case("autoscaling/v2beta1", HpaVersion::V2beta1)]
    #[case("autoscaling/v2beta2", HpaVersion::V2beta2)]
    #[case(" v2 ", HpaVersion::V2)]
    fn test_parse_version(#[case] raw: &str, #[case] expected: HpaVersion) {
        assert_eq!(HpaVersion::parse(raw).unwrap(), expected);
    }

    #[test]
    fn test_unknown_version_is_sentinel() {
        let err = HpaVersion::parse("autoscaling/v3").unwrap_err();
        assert_eq!(err.to_string(), "hpa version unknown");
    }

    #[test]
    fn test_latest_of_offered() {
        assert_eq!(
            HpaVersion::latest_of(["v2", "v1"]).unwrap(),
            HpaVersion::V2
        );
        assert_eq!(
            HpaVersion::latest_of(["v1", "v2beta1", "v2beta2"]).unwrap(),
            HpaVersion::V2beta2
        );
        assert!(HpaVersion::latest_of(["v3alpha1"]).is_err());
    }

    #[test]
    fn test_api_resource_plural() {
        let ar = HpaVersion::V2beta2.api_resource();
        assert_eq!(ar.plural, "horizontalpodautoscalers");
        assert_eq!(ar.api_version, "autoscaling/v2beta2");
    }

    #[test]
    fn test_decode_v1() {
        let obj = dynamic(
            HpaVersion::V1,
            json!({
                "spec": {
                    "maxReplicas": 10,
                    "scaleTargetRef": {"apiVersion": "apps/v1", "kind": "Deployment", "name": "web"},
                    "targetCPUUtilizationPercentage": 70
                },
                "status": {"currentReplicas": 3, "desiredReplicas": 4}
            }),
        );
        let hpa = HorizontalPodAutoscaler::from_dynamic(HpaVersion::V1, &obj).unwrap();
        assert_eq!(hpa.key(), "shop/web");
        assert_eq!(hpa.min_replicas, MINIMUM_REPLICAS);
        assert_eq!(hpa.max_replicas, 10);
        assert_eq!((hpa.current_replicas, hpa.desired_replicas), (3, 4));
        assert_eq!(hpa.scale_target_ref.deployment_name().unwrap(), "web");
    }

    #[rstest]
    #[case(HpaVersion::V2beta1)]
    #[case(HpaVersion::V2beta2)]
    #[case(HpaVersion::V2)]
    fn test_decode_v2_family(#[case] version: HpaVersion) {
        let obj = dynamic(
            version,
            json!({
                "spec": {
                    "minReplicas": 2,
                    "maxReplicas": 8,
                    "scaleTargetRef": {"apiVersion": "apps/v1", "kind": "Deployment", "name": "web"},
                    "metrics": [
                        {"type": "Resource", "resource": {"name": "cpu", "target": {"type": "Utilization", "averageUtilization": 60}}}
                    ]
                },
                "status": {"currentReplicas": 2, "desiredReplicas": 2}
            }),
        );
        let hpa = HorizontalPodAutoscaler::from_dynamic(version, &obj).unwrap();
        assert_eq!(hpa.version, version);
        assert_eq!((hpa.min_replicas, hpa.max_replicas), (2, 8));
        assert_eq!(hpa.current_replicas, 2);
        assert_eq!(hpa.scale_target_ref.deployment_name().unwrap(), "web");
    }

    #[test]
    fn test_statefulset_target_unresolvable() {
        let target = ScaleTargetRef {
            api_version: "apps/v1".to_string(),
            kind: "StatefulSet".to_string(),
            name: "db".to_string(),
        };
        assert_eq!(
            target.deployment_name().unwrap_err().to_string(),
            "target ref resolve error"
        );
    }

    #[test]
    fn test_apply_override() {
        let mut data = json!({"spec": {"minReplicas": 2, "maxReplicas": 4, "metrics": []}});
        apply_override(&mut data, None, 40);
        assert_eq!(data["spec"]["minReplicas"], 1);
        assert_eq!(data["spec"]["maxReplicas"], 40);
        assert!(data["spec"]["metrics"].is_array());

        let mut empty = json!({});
        apply_override(&mut empty, Some(5), 9);
        assert_eq!(empty["spec"]["minReplicas"], 5);
    }
}

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::ServerSpec;

/// A set of homogeneous Servers sharing one template, kept at a declared
/// replica count.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "Fleet",
    group = "gameserver.arcadia.dev",
    version = "v1alpha1",
    namespaced,
    status = "FleetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct FleetSpec {
    pub scaling: ScalingSpec,
    /// Server template every replica is stamped from.
    pub template: ServerSpec,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSpec {
    pub replicas: i32,
    /// Which end of the age spectrum scale-down removes first.
    #[serde(default)]
    pub age_priority: AgePriority,
    /// Prefer victims whose sidecar already permits deletion.
    #[serde(default)]
    pub prioritize_allowed: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AgePriority {
    #[default]
    Oldest,
    Newest,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
    /// Count of Servers carrying this fleet's label that are not terminating.
    #[serde(default)]
    pub current_replicas: i32,
}

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::FleetSpec;

/// A named, versioned server template owning one active Fleet.
///
/// When the embedded template changes, the rollover controller creates a
/// replacement Fleet before retiring the superseded one, so in-flight
/// sessions keep running on the old template until they drain.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "GameType",
    group = "gameserver.arcadia.dev",
    version = "v1alpha1",
    namespaced,
    status = "GameTypeStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GameTypeSpec {
    pub fleet: FleetSpec,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameTypeStatus {
    /// Name of the youngest owned Fleet.
    #[serde(default)]
    pub current_fleet: String,
    /// Replica count declared on that Fleet.
    #[serde(default)]
    pub current_fleet_replicas: i32,
}

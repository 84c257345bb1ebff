use k8s_openapi::{
    api::core::v1::PodSpec, apimachinery::pkg::apis::meta::v1::Condition,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One schedulable unit wrapping a single running game-server instance.
///
/// The operator backs every Server with exactly one Pod and gates the Pod's
/// removal behind the sidecar's deletion handshake.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "Server",
    group = "gameserver.arcadia.dev",
    version = "v1alpha1",
    namespaced,
    status = "ServerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Pod spec the game server runs as. The sidecar container is appended by
    /// the operator and must not be declared here.
    pub pod: PodSpec,
    /// Grace timeout for deletion. Once this much time has passed since the
    /// deletion request, the server is removed even if the sidecar still
    /// refuses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
    /// Skip the sidecar handshake entirely and allow immediate deletion.
    #[serde(default)]
    pub allow_force_delete: bool,
    #[serde(default)]
    pub sidecar: SidecarSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game: Option<GameInfo>,
}

/// Settings for the sidecar container injected next to the game server.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSettings {
    /// Port the sidecar serves its HTTP surface on.
    #[serde(default = "default_sidecar_port")]
    pub port: u16,
    #[serde(default = "default_sidecar_image")]
    pub image: String,
    #[serde(default)]
    pub log_debug: bool,
}

fn default_sidecar_port() -> u16 {
    8080
}

fn default_sidecar_image() -> String {
    "arcadia/gameserver-sidecar:latest".to_string()
}

impl Default for SidecarSettings {
    fn default() -> Self {
        Self {
            port: default_sidecar_port(),
            image: default_sidecar_image(),
            log_debug: false,
        }
    }
}

/// Game-specific capacity hint, opaque to the operator.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct GameInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
pub struct ServerStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Periodically asks an external decision source for a desired replica count
/// and writes it onto the target GameType. Stateless: no status is persisted
/// and no finalizer is attached.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "GameTypeAutoscaler",
    group = "gameserver.arcadia.dev",
    version = "v1alpha1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GameTypeAutoscalerSpec {
    /// Name of the GameType to scale, in the autoscaler's namespace.
    pub game_type_name: String,
    pub policy: AutoscalePolicy,
    pub sync: SyncSpec,
}

/// How to compute the desired replica count. Only the `webhook` strategy is
/// supported; anything else is rejected at reconcile time so new strategies
/// can be rolled out without a schema change.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalePolicy {
    pub r#type: String,
    #[serde(default)]
    pub webhook: WebhookPolicy,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPolicy {
    /// Full URL of the decision endpoint. Takes precedence over `service`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub name: String,
    pub namespace: String,
    pub port: i32,
}

/// When to re-run the decision. Only `fixedinterval` is supported.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    pub r#type: String,
    pub interval_seconds: u64,
}

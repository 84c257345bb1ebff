pub mod autoscaler;
pub mod fleet;
pub mod game_type;
pub mod server;

use std::{fmt::Debug, sync::Arc};

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::{
    api::{ListParams, Patch, PatchParams},
    client::Client,
    runtime::events::{Recorder, Reporter},
    Api, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tracing::{info, instrument};

use crate::{
    agent::DeletionCheck,
    autoscale::ScaleDecision,
    crd::{Fleet, GameType, GameTypeAutoscaler, Server},
    error::Error,
};

pub const FIELD_MANAGER_NAME: &str = "gameserver-operator";

/// Shared state handed to every reconciler.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub reporter: Reporter,
    /// Capability arbitrating whether a running server may be deleted.
    pub deletion: Arc<dyn DeletionCheck>,
    /// Capability computing autoscale decisions.
    pub decision: Arc<dyn ScaleDecision>,
    /// Surface a sidecar's "not allowed" answer as a reconcile error instead
    /// of a quiet requeue.
    pub error_on_denied: bool,
}

impl Context {
    pub fn recorder<K>(&self, object: &K) -> Recorder
    where
        K: Resource<DynamicType = ()>,
    {
        Recorder::new(self.client.clone(), self.reporter.clone(), object.object_ref(&()))
    }
}

pub(crate) fn has_finalizer<K: ResourceExt>(object: &K, finalizer: &str) -> bool {
    object.finalizers().iter().any(|f| f == finalizer)
}

/// Merge patch replacing the finalizer list. The observed resourceVersion is
/// included so a write racing another actor's finalizer update conflicts
/// with a 409 and gets retried on a fresh read instead of silently dropping
/// the other actor's entry.
pub(crate) fn finalizers_patch<K: ResourceExt>(
    object: &K,
    finalizers: Vec<String>,
) -> serde_json::Value {
    let mut metadata = serde_json::json!({ "finalizers": finalizers });
    if let Some(rv) = object.resource_version() {
        metadata["resourceVersion"] = serde_json::Value::String(rv);
    }
    serde_json::json!({ "metadata": metadata })
}

pub(crate) async fn add_finalizer<K>(api: &Api<K>, object: &K, finalizer: &str) -> Result<(), Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let mut finalizers = object.finalizers().to_vec();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());
    api.patch(
        &object.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&finalizers_patch(object, finalizers)),
    )
    .await?;
    Ok(())
}

/// Removes only the given finalizer, leaving any attached by other actors.
pub(crate) async fn remove_finalizer<K>(
    api: &Api<K>,
    object: &K,
    finalizer: &str,
) -> Result<(), Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    let finalizers: Vec<_> = object
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    api.patch(
        &object.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&finalizers_patch(object, finalizers)),
    )
    .await?;
    Ok(())
}

/// Upserts a condition, reporting whether anything other than the transition
/// time changed. Callers skip the status write when nothing did, so a settled
/// resource reconciles without producing new writes.
pub(crate) fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> bool {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status == status && existing.reason == reason && existing.message == message {
            return false;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.last_transition_time = Time(Utc::now());
        return true;
    }
    conditions.push(Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(Utc::now()),
        observed_generation: None,
    });
    true
}

/// Runs all four controllers until shutdown.
#[instrument(skip_all)]
pub async fn run(ctx: Context) -> Result<(), Error> {
    info!("checking if CRDs are installed");
    let probe = ListParams::default().limit(1);
    Api::<Server>::all(ctx.client.clone()).list(&probe).await?;
    Api::<Fleet>::all(ctx.client.clone()).list(&probe).await?;
    Api::<GameType>::all(ctx.client.clone()).list(&probe).await?;
    Api::<GameTypeAutoscaler>::all(ctx.client.clone())
        .list(&probe)
        .await?;
    info!("confirmed that CRDs are installed");

    let ctx = Arc::new(ctx);
    tokio::try_join!(
        server::run(ctx.clone()),
        fleet::run(ctx.clone()),
        game_type::run(ctx.clone()),
        autoscaler::run(ctx),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizer_patch_pins_the_observed_resource_version() {
        let mut server = Server::new("game-0", Default::default());
        server.metadata.resource_version = Some("4711".to_string());

        let patch = finalizers_patch(&server, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(patch["metadata"]["resourceVersion"], "4711");
        assert_eq!(patch["metadata"]["finalizers"][1], "b");

        // A fixture without a resourceVersion must not null the field out.
        let fresh = Server::new("game-1", Default::default());
        let patch = finalizers_patch(&fresh, Vec::new());
        assert!(patch["metadata"].get("resourceVersion").is_none());
    }

    #[test]
    fn set_condition_is_idempotent() {
        let mut conditions = Vec::new();
        assert!(set_condition(&mut conditions, "PodCreated", "True", "PodCreatedSuccessfully", "Pod has been created"));
        assert!(!set_condition(&mut conditions, "PodCreated", "True", "PodCreatedSuccessfully", "Pod has been created"));
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn set_condition_flips_status_in_place() {
        let mut conditions = Vec::new();
        set_condition(&mut conditions, "PodFailed", "False", "PodCreationFailed", "boom");
        assert!(set_condition(&mut conditions, "PodFailed", "True", "PodCreationFailed", "boom"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "True");
    }
}

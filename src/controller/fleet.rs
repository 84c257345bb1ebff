use std::{collections::BTreeSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    runtime::{
        controller::{Action, Config as ControllerConfig},
        events::{EventType, Recorder},
        watcher, Controller,
    },
    Api, Resource, ResourceExt,
};
use tokio_stream::StreamExt;
use tracing::{error, info, instrument};

use crate::{
    controller::{add_finalizer, has_finalizer, remove_finalizer, Context},
    crd::{AgePriority, Fleet, ScalingSpec, Server, FLEET_LABEL},
    error::Error,
    events::{emit, EventReason},
    pod::pod_name,
};

pub const FLEET_FINALIZER: &str = "fleet.gameserver.arcadia.dev/finalizer";

/// Requeue used while a drain or scale action is still converging.
const CONVERGE_REQUEUE: Duration = Duration::from_secs(2);

#[instrument(skip_all, fields(fleet = %fleet.name_any()))]
async fn reconcile(fleet: Arc<Fleet>, ctx: Arc<Context>) -> Result<Action, Error> {
    let ns = fleet.namespace().unwrap();
    let fleets: Api<Fleet> = Api::namespaced(ctx.client.clone(), &ns);
    let servers: Api<Server> = Api::namespaced(ctx.client.clone(), &ns);
    let recorder = ctx.recorder(fleet.as_ref());

    // Deletion first so a terminating fleet never scales again.
    if fleet.meta().deletion_timestamp.is_some() {
        return handle_deletion(&fleet, &fleets, &servers, &recorder).await;
    }

    if !has_finalizer(fleet.as_ref(), FLEET_FINALIZER) {
        if let Err(err) = add_finalizer(&fleets, fleet.as_ref(), FLEET_FINALIZER).await {
            emit(
                &recorder,
                EventType::Warning,
                EventReason::FleetUpdateFailed,
                format!("Fleet finalizer update failed: {err}"),
            )
            .await;
            return Err(err);
        }
        emit(
            &recorder,
            EventType::Normal,
            EventReason::FleetInitialized,
            "Fleet finalizers added".to_string(),
        )
        .await;
        return Ok(Action::await_change());
    }

    // The replica count is always recomputed from a live list; stale status
    // is never trusted.
    let live = list_servers(&servers, &fleet.name_any()).await?;
    let mut current = live_count(&live);
    let desired = fleet.spec.scaling.replicas;
    let mut scaled = false;
    if current != desired {
        scale(&fleet, &ns, &servers, &ctx, &recorder, current, &live).await?;
        scaled = true;
        let live = list_servers(&servers, &fleet.name_any()).await?;
        current = live_count(&live);
    }

    let reported = fleet
        .status
        .as_ref()
        .map(|s| s.current_replicas)
        .unwrap_or_default();
    if fleet.status.is_none() || reported != current {
        let patch = serde_json::json!({ "status": { "currentReplicas": current } });
        fleets
            .patch_status(
                &fleet.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
    }

    if scaled {
        Ok(Action::requeue(CONVERGE_REQUEUE))
    } else {
        Ok(Action::await_change())
    }
}

/// One scale step towards the desired count. Scale-up creates the whole
/// delta; scale-down removes a single victim per pass so every deletion goes
/// through the server controller's handshake individually.
async fn scale(
    fleet: &Fleet,
    ns: &str,
    servers: &Api<Server>,
    ctx: &Context,
    recorder: &Recorder,
    current: i32,
    live: &[Server],
) -> Result<(), Error> {
    let desired = fleet.spec.scaling.replicas;

    if current < desired {
        for _ in 0..(desired - current) {
            let server = server_for_fleet(fleet);
            if let Err(err) = servers.create(&PostParams::default(), &server).await {
                emit(
                    recorder,
                    EventType::Warning,
                    EventReason::FleetScale,
                    format!("Failed to create a server: {err}"),
                )
                .await;
                return Err(err.into());
            }
        }
        emit(
            recorder,
            EventType::Normal,
            EventReason::FleetScale,
            format!("Scaled servers up to {desired}"),
        )
        .await;
    }

    if current > desired {
        let allowed = if fleet.spec.scaling.prioritize_allowed {
            collect_allowed(live, ns, ctx).await
        } else {
            BTreeSet::new()
        };
        let Some(victim) = select_victim(live, &fleet.spec.scaling, &allowed) else {
            return Ok(());
        };
        match servers
            .delete(&victim.name_any(), &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(err) => {
                emit(
                    recorder,
                    EventType::Warning,
                    EventReason::FleetScale,
                    format!("Failed to delete a server: {err}"),
                )
                .await;
                return Err(err.into());
            }
        }
        emit(
            recorder,
            EventType::Normal,
            EventReason::FleetScale,
            format!("Scaled servers down to {desired}"),
        )
        .await;
    }

    Ok(())
}

/// Asks the sidecars which live servers already permit deletion. Answers are
/// advisory, only used to steer victim selection; an unreachable sidecar
/// simply leaves its server out of the preferred set. The read-only query is
/// used here: most of the asked servers survive the scale-down, so none of
/// them may be told to shut down.
async fn collect_allowed(live: &[Server], ns: &str, ctx: &Context) -> BTreeSet<String> {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), ns);
    let mut allowed = BTreeSet::new();
    for server in live {
        if server.meta().deletion_timestamp.is_some() {
            continue;
        }
        let verdict = match pods.get_opt(&pod_name(&server.name_any())).await {
            // No pod means nothing to drain.
            Ok(None) => true,
            Ok(Some(pod)) => ctx
                .deletion
                .query_deletion_allowed(server, &pod)
                .await
                .unwrap_or(false),
            Err(_) => false,
        };
        if verdict {
            allowed.insert(server.name_any());
        }
    }
    allowed
}

/// Deterministic victim selection: terminating servers are never picked;
/// `prioritize_allowed` narrows to servers already safe to delete (when any
/// are); age priority orders by creation timestamp; ties break by name.
pub fn select_victim<'a>(
    servers: &'a [Server],
    scaling: &ScalingSpec,
    allowed: &BTreeSet<String>,
) -> Option<&'a Server> {
    let mut candidates: Vec<&Server> = servers
        .iter()
        .filter(|s| s.meta().deletion_timestamp.is_none())
        .collect();
    if candidates.is_empty() {
        return None;
    }
    if scaling.prioritize_allowed {
        let preferred: Vec<&Server> = candidates
            .iter()
            .copied()
            .filter(|s| allowed.contains(&s.name_any()))
            .collect();
        if !preferred.is_empty() {
            candidates = preferred;
        }
    }
    candidates.sort_by(|a, b| {
        let by_age = match scaling.age_priority {
            AgePriority::Oldest => created_at(a).cmp(&created_at(b)),
            AgePriority::Newest => created_at(b).cmp(&created_at(a)),
        };
        by_age.then_with(|| a.name_any().cmp(&b.name_any()))
    });
    candidates.first().copied()
}

fn created_at(server: &Server) -> DateTime<Utc> {
    server
        .creation_timestamp()
        .map(|t| t.0)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn live_count(servers: &[Server]) -> i32 {
    servers
        .iter()
        .filter(|s| s.meta().deletion_timestamp.is_none())
        .count() as i32
}

/// Stamps a new Server from the fleet's template, inheriting the fleet's
/// labels plus the `fleet` selector label.
pub fn server_for_fleet(fleet: &Fleet) -> Server {
    let mut labels = fleet.labels().clone();
    labels.insert(FLEET_LABEL.to_string(), fleet.name_any());

    let mut metadata = ObjectMeta {
        generate_name: Some(format!("{}-", fleet.name_any())),
        namespace: fleet.namespace(),
        labels: Some(labels),
        ..Default::default()
    };
    if let Some(oref) = fleet.controller_owner_ref(&()) {
        metadata.owner_references = Some(vec![oref]);
    }

    Server {
        metadata,
        spec: fleet.spec.template.clone(),
        status: None,
    }
}

async fn list_servers(servers: &Api<Server>, fleet_name: &str) -> Result<Vec<Server>, Error> {
    let params = ListParams::default().labels(&format!("{FLEET_LABEL}={fleet_name}"));
    Ok(servers.list(&params).await?.items)
}

/// Cascade drain: trigger deletion of every labelled server, then requeue
/// until the set is empty before releasing the fleet's own finalizer.
async fn handle_deletion(
    fleet: &Fleet,
    fleets: &Api<Fleet>,
    servers: &Api<Server>,
    recorder: &Recorder,
) -> Result<Action, Error> {
    let live = list_servers(servers, &fleet.name_any()).await?;
    for server in &live {
        match servers
            .delete(&server.name_any(), &DeleteParams::default())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(err) => return Err(err.into()),
        }
    }

    let remaining = list_servers(servers, &fleet.name_any()).await?;
    if !remaining.is_empty() {
        return Ok(Action::requeue(CONVERGE_REQUEUE));
    }

    if has_finalizer(fleet, FLEET_FINALIZER) {
        if let Err(err) = remove_finalizer(fleets, fleet, FLEET_FINALIZER).await {
            emit(
                recorder,
                EventType::Warning,
                EventReason::FleetUpdateFailed,
                format!("Failed to remove finalizer: {err}"),
            )
            .await;
            return Err(err);
        }
        emit(
            recorder,
            EventType::Normal,
            EventReason::FleetDrained,
            "Fleet finalizers removed".to_string(),
        )
        .await;
    }
    Ok(Action::await_change())
}

#[instrument(skip_all)]
fn error_policy(_object: Arc<Fleet>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, "error occured on fleet reconcile loop");
    Action::requeue(Duration::from_secs(10))
}

#[instrument(skip_all)]
pub async fn run(ctx: Arc<Context>) -> Result<(), Error> {
    let fleets = Api::<Fleet>::all(ctx.client.clone());
    let servers = Api::<Server>::all(ctx.client.clone());

    let stream = Controller::new(fleets, watcher::Config::default().any_semantic())
        .owns(servers, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(10))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx);
    let mut stream = std::pin::pin!(stream);

    info!("starting up fleet controller loop");
    while let Some(res) = stream.next().await {
        if let Err(e) = res {
            error!(error = ?e, "error occured on fleet controller loop");
        }
    }
    info!("fleet controller has been terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{FleetSpec, ServerSpec};
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn server(name: &str, created_secs: i64) -> Server {
        let mut server = Server::new(name, ServerSpec::default());
        server.metadata.creation_timestamp =
            Some(Time(Utc.timestamp_opt(created_secs, 0).unwrap()));
        server
    }

    fn scaling(age_priority: AgePriority, prioritize_allowed: bool) -> ScalingSpec {
        ScalingSpec {
            replicas: 1,
            age_priority,
            prioritize_allowed,
        }
    }

    #[test]
    fn oldest_priority_picks_the_oldest() {
        let servers = vec![server("b", 200), server("a", 100), server("c", 300)];
        let victim = select_victim(&servers, &scaling(AgePriority::Oldest, false), &BTreeSet::new());
        assert_eq!(victim.unwrap().name_any(), "a");
    }

    #[test]
    fn newest_priority_picks_the_newest() {
        let servers = vec![server("b", 200), server("a", 100), server("c", 300)];
        let victim = select_victim(&servers, &scaling(AgePriority::Newest, false), &BTreeSet::new());
        assert_eq!(victim.unwrap().name_any(), "c");
    }

    #[test]
    fn equal_timestamps_break_ties_by_name() {
        let servers = vec![server("gamma", 100), server("alpha", 100), server("beta", 100)];
        for priority in [AgePriority::Oldest, AgePriority::Newest] {
            let victim = select_victim(&servers, &scaling(priority, false), &BTreeSet::new());
            assert_eq!(victim.unwrap().name_any(), "alpha");
        }
    }

    #[test]
    fn terminating_servers_are_never_selected() {
        let mut terminating = server("a", 100);
        terminating.metadata.deletion_timestamp = Some(Time(Utc.timestamp_opt(400, 0).unwrap()));
        let servers = vec![terminating, server("b", 200)];
        let victim = select_victim(&servers, &scaling(AgePriority::Oldest, false), &BTreeSet::new());
        assert_eq!(victim.unwrap().name_any(), "b");

        let mut only = server("a", 100);
        only.metadata.deletion_timestamp = Some(Time(Utc.timestamp_opt(400, 0).unwrap()));
        assert!(select_victim(&[only], &scaling(AgePriority::Oldest, false), &BTreeSet::new()).is_none());
    }

    #[test]
    fn prioritize_allowed_narrows_the_candidates() {
        let servers = vec![server("a", 100), server("b", 200), server("c", 300)];
        let allowed = BTreeSet::from(["c".to_string()]);
        let victim = select_victim(&servers, &scaling(AgePriority::Oldest, true), &allowed);
        assert_eq!(victim.unwrap().name_any(), "c");
    }

    #[test]
    fn prioritize_allowed_falls_back_when_none_permit() {
        let servers = vec![server("a", 100), server("b", 200)];
        let victim = select_victim(&servers, &scaling(AgePriority::Oldest, true), &BTreeSet::new());
        assert_eq!(victim.unwrap().name_any(), "a");
    }

    #[test]
    fn live_count_ignores_terminating() {
        let mut terminating = server("a", 100);
        terminating.metadata.deletion_timestamp = Some(Time(Utc.timestamp_opt(400, 0).unwrap()));
        let servers = vec![terminating, server("b", 200), server("c", 300)];
        assert_eq!(live_count(&servers), 2);
    }

    #[test]
    fn stamped_server_inherits_labels_and_template() {
        let mut fleet = Fleet::new(
            "lobby",
            FleetSpec {
                scaling: scaling(AgePriority::Oldest, false),
                template: ServerSpec {
                    allow_force_delete: true,
                    ..Default::default()
                },
            },
        );
        fleet.metadata.namespace = Some("games".to_string());
        fleet.metadata.uid = Some("11e087f1".to_string());
        fleet
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("gametype".to_string(), "lobby-type".to_string());

        let server = server_for_fleet(&fleet);
        assert_eq!(server.metadata.generate_name.as_deref(), Some("lobby-"));
        assert_eq!(server.metadata.namespace.as_deref(), Some("games"));
        let labels = server.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(FLEET_LABEL).map(String::as_str), Some("lobby"));
        assert_eq!(labels.get("gametype").map(String::as_str), Some("lobby-type"));
        assert!(server.spec.allow_force_delete);
        assert_eq!(server.metadata.owner_references.as_ref().unwrap()[0].kind, "Fleet");
    }
}

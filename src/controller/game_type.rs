use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use kube::{
    api::{DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams},
    runtime::{
        controller::Action,
        events::{EventType, Recorder},
        watcher, Controller,
    },
    Api, Resource, ResourceExt,
};
use tokio_stream::StreamExt;
use tracing::{error, info, instrument};

use crate::{
    controller::{add_finalizer, has_finalizer, remove_finalizer, Context},
    crd::{Fleet, FleetSpec, GameType, GAME_TYPE_LABEL},
    error::Error,
    events::{emit, EventReason},
};

pub const GAME_TYPE_FINALIZER: &str = "gametype.gameserver.arcadia.dev/finalizer";

const CONVERGE_REQUEUE: Duration = Duration::from_secs(2);

#[instrument(skip_all, fields(gametype = %game_type.name_any()))]
async fn reconcile(game_type: Arc<GameType>, ctx: Arc<Context>) -> Result<Action, Error> {
    let ns = game_type.namespace().unwrap();
    let game_types: Api<GameType> = Api::namespaced(ctx.client.clone(), &ns);
    let fleets: Api<Fleet> = Api::namespaced(ctx.client.clone(), &ns);
    let recorder = ctx.recorder(game_type.as_ref());

    if game_type.meta().deletion_timestamp.is_none()
        && !has_finalizer(game_type.as_ref(), GAME_TYPE_FINALIZER)
    {
        if let Err(err) = add_finalizer(&game_types, game_type.as_ref(), GAME_TYPE_FINALIZER).await
        {
            emit(
                &recorder,
                EventType::Warning,
                EventReason::GameTypeInitialized,
                format!("failed to add finalizers: {err}"),
            )
            .await;
            return Err(err);
        }
        emit(
            &recorder,
            EventType::Normal,
            EventReason::GameTypeInitialized,
            "Added finalizers to gametype".to_string(),
        )
        .await;
        return Ok(Action::await_change());
    }

    if game_type.meta().deletion_timestamp.is_some() {
        return handle_deletion(&game_type, &game_types, &fleets, &recorder).await;
    }

    let owned = list_fleets(&fleets, &game_type.name_any()).await?;
    match owned.len() {
        0 => {
            // Make-before-break start state: one fleet stamped from the
            // embedded template.
            create_fleet(&game_type, &fleets, &recorder).await?;
            emit(
                &recorder,
                EventType::Normal,
                EventReason::GameTypeInitialized,
                "Created initial fleet".to_string(),
            )
            .await;
            return Ok(Action::await_change());
        }
        1 => {
            let fleet = &owned[0];
            if !templates_equal(&fleet.spec, &game_type.spec.fleet) {
                // Never mutate a live fleet's template in place; already
                // running servers were created from the old one. Roll over
                // instead: the new fleet comes up, then the old one drains.
                emit(
                    &recorder,
                    EventType::Normal,
                    EventReason::GameTypeSpecUpdated,
                    "Template changed, creating replacement fleet".to_string(),
                )
                .await;
                create_fleet(&game_type, &fleets, &recorder).await?;
                return Ok(Action::await_change());
            }
            let desired = game_type.spec.fleet.scaling.replicas;
            if fleet.spec.scaling.replicas != desired {
                // A pure scale change is cheap and safe in place.
                let patch = serde_json::json!({ "spec": { "scaling": { "replicas": desired } } });
                fleets
                    .patch(
                        &fleet.name_any(),
                        &PatchParams::default(),
                        &Patch::Merge(&patch),
                    )
                    .await?;
                emit(
                    &recorder,
                    EventType::Normal,
                    EventReason::GameTypeReplicasUpdated,
                    format!("Scaling gametype to {desired}"),
                )
                .await;
                return Ok(Action::await_change());
            }
        }
        _ => {
            // Retire the predecessor; the youngest fleet survives. One
            // deletion per pass, convergence happens over successive events
            // as the old fleet drains through its own finalizer.
            if let Some(oldest) = oldest_fleet(&owned) {
                if oldest.meta().deletion_timestamp.is_none() {
                    emit(
                        &recorder,
                        EventType::Normal,
                        EventReason::GameTypeDeleting,
                        format!("Deleting superseded fleet {}", oldest.name_any()),
                    )
                    .await;
                    match fleets
                        .delete(&oldest.name_any(), &DeleteParams::default())
                        .await
                    {
                        Ok(_) => {}
                        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                        Err(err) => return Err(err.into()),
                    }
                    return Ok(Action::requeue(CONVERGE_REQUEUE));
                }
            }
        }
    }

    let owned = list_fleets(&fleets, &game_type.name_any()).await?;
    sync_status(&game_type, &game_types, &owned).await?;
    Ok(Action::await_change())
}

/// Keeps the recorded current fleet pointed at the youngest owned fleet.
async fn sync_status(
    game_type: &GameType,
    game_types: &Api<GameType>,
    owned: &[Fleet],
) -> Result<(), Error> {
    let Some(youngest) = youngest_fleet(owned) else {
        return Ok(());
    };
    let current_fleet = youngest.name_any();
    let current_replicas = youngest.spec.scaling.replicas;

    let unchanged = game_type.status.as_ref().is_some_and(|status| {
        status.current_fleet == current_fleet && status.current_fleet_replicas == current_replicas
    });
    if unchanged {
        return Ok(());
    }
    let patch = serde_json::json!({
        "status": {
            "currentFleet": current_fleet,
            "currentFleetReplicas": current_replicas,
        }
    });
    game_types
        .patch_status(
            &game_type.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
    Ok(())
}

/// Structural equality over the part of a fleet spec the gametype controls.
/// Scaling is deliberately excluded: a replica drift is propagated in place,
/// only a template drift triggers rollover.
pub fn templates_equal(a: &FleetSpec, b: &FleetSpec) -> bool {
    a.template == b.template
}

// Timestamps have second precision, so two fleets born inside one rollover
// can tie on age. The tie-breaks sit on opposite ends of the name order so
// the fleet kept as current is never also the one marked for deletion.
pub fn oldest_fleet(fleets: &[Fleet]) -> Option<&Fleet> {
    fleets
        .iter()
        .min_by(|a, b| created_at(a).cmp(&created_at(b)).then_with(|| a.name_any().cmp(&b.name_any())))
}

pub fn youngest_fleet(fleets: &[Fleet]) -> Option<&Fleet> {
    fleets
        .iter()
        .max_by(|a, b| created_at(a).cmp(&created_at(b)).then_with(|| a.name_any().cmp(&b.name_any())))
}

fn created_at(fleet: &Fleet) -> DateTime<Utc> {
    fleet
        .creation_timestamp()
        .map(|t| t.0)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Stamps a fleet from the gametype's embedded template, labelled and owned
/// so the cascade and status queries can find it.
pub fn fleet_for_game_type(game_type: &GameType) -> Fleet {
    let mut labels = game_type.labels().clone();
    labels.insert(GAME_TYPE_LABEL.to_string(), game_type.name_any());

    let mut metadata = ObjectMeta {
        generate_name: Some(format!("{}-", game_type.name_any())),
        namespace: game_type.namespace(),
        labels: Some(labels),
        ..Default::default()
    };
    if let Some(oref) = game_type.controller_owner_ref(&()) {
        metadata.owner_references = Some(vec![oref]);
    }

    Fleet {
        metadata,
        spec: game_type.spec.fleet.clone(),
        status: None,
    }
}

async fn create_fleet(
    game_type: &GameType,
    fleets: &Api<Fleet>,
    recorder: &Recorder,
) -> Result<(), Error> {
    let fleet = fleet_for_game_type(game_type);
    if let Err(err) = fleets.create(&PostParams::default(), &fleet).await {
        emit(
            recorder,
            EventType::Warning,
            EventReason::GameTypeSpecUpdated,
            format!("Failed to create new fleet: {err}"),
        )
        .await;
        return Err(err.into());
    }
    Ok(())
}

async fn list_fleets(fleets: &Api<Fleet>, game_type_name: &str) -> Result<Vec<Fleet>, Error> {
    let params = ListParams::default().labels(&format!("{GAME_TYPE_LABEL}={game_type_name}"));
    Ok(fleets.list(&params).await?.items)
}

/// Cascade drain mirroring the fleet controller's: trigger deletion of every
/// owned fleet, requeue until the labelled set is empty, then release the
/// finalizer.
async fn handle_deletion(
    game_type: &GameType,
    game_types: &Api<GameType>,
    fleets: &Api<Fleet>,
    recorder: &Recorder,
) -> Result<Action, Error> {
    let owned = list_fleets(fleets, &game_type.name_any()).await?;
    for fleet in &owned {
        emit(
            recorder,
            EventType::Normal,
            EventReason::GameTypeDeleting,
            format!("Deleting fleet {}", fleet.name_any()),
        )
        .await;
        match fleets.delete(&fleet.name_any(), &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(err) => return Err(err.into()),
        }
    }

    let remaining = list_fleets(fleets, &game_type.name_any()).await?;
    if !remaining.is_empty() {
        return Ok(Action::requeue(CONVERGE_REQUEUE));
    }

    if has_finalizer(game_type, GAME_TYPE_FINALIZER) {
        remove_finalizer(game_types, game_type, GAME_TYPE_FINALIZER).await?;
        emit(
            recorder,
            EventType::Normal,
            EventReason::GameTypeDrained,
            "Removed finalizer".to_string(),
        )
        .await;
    }
    Ok(Action::await_change())
}

#[instrument(skip_all)]
fn error_policy(_object: Arc<GameType>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, "error occured on gametype reconcile loop");
    Action::requeue(Duration::from_secs(10))
}

#[instrument(skip_all)]
pub async fn run(ctx: Arc<Context>) -> Result<(), Error> {
    let game_types = Api::<GameType>::all(ctx.client.clone());
    let fleets = Api::<Fleet>::all(ctx.client.clone());

    let stream = Controller::new(game_types, watcher::Config::default().any_semantic())
        .owns(fleets, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx);
    let mut stream = std::pin::pin!(stream);

    info!("starting up gametype controller loop");
    while let Some(res) = stream.next().await {
        if let Err(e) = res {
            error!(error = ?e, "error occured on gametype controller loop");
        }
    }
    info!("gametype controller has been terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GameTypeSpec, ScalingSpec, ServerSpec};
    use chrono::TimeZone;
    use k8s_openapi::{
        api::core::v1::{Container, PodSpec},
        apimachinery::pkg::apis::meta::v1::Time,
    };

    fn fleet_spec(replicas: i32, image: &str) -> FleetSpec {
        FleetSpec {
            scaling: ScalingSpec {
                replicas,
                ..Default::default()
            },
            template: ServerSpec {
                pod: PodSpec {
                    containers: vec![Container {
                        name: "game".to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }

    fn fleet(name: &str, created_secs: i64) -> Fleet {
        let mut fleet = Fleet::new(name, fleet_spec(1, "arcadia/lobby:1"));
        fleet.metadata.creation_timestamp =
            Some(Time(Utc.timestamp_opt(created_secs, 0).unwrap()));
        fleet
    }

    #[test]
    fn scale_only_drift_is_not_a_template_change() {
        let a = fleet_spec(3, "arcadia/lobby:1");
        let b = fleet_spec(7, "arcadia/lobby:1");
        assert!(templates_equal(&a, &b));
    }

    #[test]
    fn image_drift_is_a_template_change() {
        let a = fleet_spec(3, "arcadia/lobby:1");
        let b = fleet_spec(3, "arcadia/lobby:2");
        assert!(!templates_equal(&a, &b));
    }

    #[test]
    fn oldest_and_youngest_pick_opposite_ends() {
        let fleets = vec![fleet("b", 200), fleet("a", 100), fleet("c", 300)];
        assert_eq!(oldest_fleet(&fleets).unwrap().name_any(), "a");
        assert_eq!(youngest_fleet(&fleets).unwrap().name_any(), "c");
    }

    #[test]
    fn fleet_age_ties_break_to_opposite_ends() {
        let fleets = vec![fleet("gamma", 100), fleet("alpha", 100)];
        assert_eq!(oldest_fleet(&fleets).unwrap().name_any(), "alpha");
        assert_eq!(youngest_fleet(&fleets).unwrap().name_any(), "gamma");
    }

    // A rollover started within the old fleet's creation second must still
    // retire a different fleet than the one recorded as current.
    #[test]
    fn same_second_rollover_never_retires_the_survivor() {
        let fleets = vec![fleet("gt-old", 100), fleet("gt-axx", 100)];
        let oldest = oldest_fleet(&fleets).unwrap().name_any();
        let youngest = youngest_fleet(&fleets).unwrap().name_any();
        assert_ne!(oldest, youngest);
    }

    #[test]
    fn stamped_fleet_carries_gametype_label_and_spec() {
        let mut game_type = GameType::new(
            "lobby",
            GameTypeSpec {
                fleet: fleet_spec(5, "arcadia/lobby:3"),
            },
        );
        game_type.metadata.namespace = Some("games".to_string());
        game_type.metadata.uid = Some("7aa91c02".to_string());

        let fleet = fleet_for_game_type(&game_type);
        assert_eq!(fleet.metadata.generate_name.as_deref(), Some("lobby-"));
        let labels = fleet.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(GAME_TYPE_LABEL).map(String::as_str), Some("lobby"));
        assert_eq!(fleet.spec.scaling.replicas, 5);
        assert_eq!(fleet.metadata.owner_references.as_ref().unwrap()[0].kind, "GameType");
    }
}

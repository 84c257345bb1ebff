use std::{sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams},
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
    controller::{add_finalizer, has_finalizer, remove_finalizer, set_condition, Context},
    crd::{Server, ServerStatus},
    error::Error,
    events::{emit, EventReason},
    pod::{pod_for_server, pod_name},
};

pub const SERVER_FINALIZER: &str = "server.gameserver.arcadia.dev/finalizer";

/// How long to wait before asking the sidecar again after a denied deletion.
const DENIED_REQUEUE: Duration = Duration::from_secs(5);

/// Outcome of the graceful-deletion handshake.
enum Handshake {
    Complete,
    Denied,
}

#[instrument(skip_all, fields(server = %server.name_any()))]
async fn reconcile(server: Arc<Server>, ctx: Arc<Context>) -> Result<Action, Error> {
    let ns = server.namespace().unwrap();
    let servers: Api<Server> = Api::namespaced(ctx.client.clone(), &ns);
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
    let recorder = ctx.recorder(server.as_ref());

    // The finalizer must be attached before any pod work so deletion is
    // always interceptable. Persist and stop; the update event re-enters.
    if server.meta().deletion_timestamp.is_none() && !has_finalizer(server.as_ref(), SERVER_FINALIZER)
    {
        if let Err(err) = add_finalizer(&servers, server.as_ref(), SERVER_FINALIZER).await {
            emit(
                &recorder,
                EventType::Warning,
                EventReason::ServerUpdateFailed,
                format!("failed to add finalizer: {err}"),
            )
            .await;
            return Err(err);
        }
        emit(
            &recorder,
            EventType::Normal,
            EventReason::ServerInitialized,
            "Finalizer added".to_string(),
        )
        .await;
        return Ok(Action::await_change());
    }

    if server.meta().deletion_timestamp.is_some() {
        return match handle_deletion(&server, &servers, &pods, &ctx, &recorder).await? {
            Handshake::Complete => {
                remove_finalizer(&servers, server.as_ref(), SERVER_FINALIZER).await?;
                emit(
                    &recorder,
                    EventType::Normal,
                    EventReason::ServerDeletionAllowed,
                    "Finalizer removed".to_string(),
                )
                .await;
                Ok(Action::await_change())
            }
            Handshake::Denied if ctx.error_on_denied => {
                Err(Error::DeletionDenied(server.name_any()))
            }
            Handshake::Denied => Ok(Action::requeue(DENIED_REQUEUE)),
        };
    }

    ensure_pod(&server, &servers, &pods, &recorder).await
}

/// Idempotent pod management for a live Server: create the backing pod if it
/// is missing, make sure it carries the server finalizer, and settle status.
async fn ensure_pod(
    server: &Server,
    servers: &Api<Server>,
    pods: &Api<Pod>,
    recorder: &Recorder,
) -> Result<Action, Error> {
    let name = server.name_any();
    let pod = pods.get_opt(&pod_name(&name)).await?;

    let Some(pod) = pod else {
        let mut status = server.status.clone().unwrap_or_default();
        let new_pod = pod_for_server(server);
        emit(
            recorder,
            EventType::Normal,
            EventReason::ServerInitialized,
            format!("Setting up sidecar with image {}", server.spec.sidecar.image),
        )
        .await;
        match pods.create(&PostParams::default(), &new_pod).await {
            Ok(_) => {}
            // Lost the race against a previous pass; the next event sees it.
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                return Ok(Action::requeue(Duration::from_secs(1)));
            }
            Err(err) => {
                set_condition(
                    &mut status.conditions,
                    "PodFailed",
                    "False",
                    "PodCreationFailed",
                    "Failed to create the Pod",
                );
                patch_status(servers, &name, &status).await?;
                emit(
                    recorder,
                    EventType::Warning,
                    EventReason::ServerPodCreationFailed,
                    format!("Pod creation errored: {err}"),
                )
                .await;
                return Err(err.into());
            }
        }
        set_condition(
            &mut status.conditions,
            "PodCreated",
            "True",
            "PodCreatedSuccessfully",
            "Pod has been successfully created",
        );
        patch_status(servers, &name, &status).await?;
        emit(
            recorder,
            EventType::Normal,
            EventReason::ServerInitialized,
            "Pod created successfully".to_string(),
        )
        .await;
        // Stop here; operating further on a not-yet-visible pod is racy.
        return Ok(Action::await_change());
    };

    // The pod is gated by the same finalizer as the server, so no other
    // actor can remove it without the handshake.
    if !has_finalizer(&pod, SERVER_FINALIZER) {
        add_finalizer(pods, &pod, SERVER_FINALIZER).await?;
        emit(
            recorder,
            EventType::Normal,
            EventReason::ServerInitialized,
            "Pod finalizer added".to_string(),
        )
        .await;
        return Ok(Action::await_change());
    }

    let mut status = server.status.clone().unwrap_or_default();
    let changed = set_condition(
        &mut status.conditions,
        "PodCreated",
        "True",
        "PodCreatedSuccessfully",
        "Pod has been successfully created",
    );
    if changed {
        patch_status(servers, &name, &status).await?;
    }
    Ok(Action::await_change())
}

/// The graceful-deletion handshake. Fails closed: any error talking to the
/// sidecar leaves the finalizer in place.
async fn handle_deletion(
    server: &Server,
    servers: &Api<Server>,
    pods: &Api<Pod>,
    ctx: &Context,
    recorder: &Recorder,
) -> Result<Handshake, Error> {
    let name = server.name_any();
    let Some(pod) = pods.get_opt(&pod_name(&name)).await? else {
        // Nothing left to drain.
        return Ok(Handshake::Complete);
    };

    let allowed = match ctx.deletion.is_deletion_allowed(server, &pod).await {
        Ok(allowed) => allowed,
        Err(err) => {
            emit(
                recorder,
                EventType::Warning,
                EventReason::ServerDeletionDenied,
                format!("Deletion check did not succeed: {err}"),
            )
            .await;
            return Err(err);
        }
    };
    if !allowed {
        emit(
            recorder,
            EventType::Normal,
            EventReason::ServerDeletionDenied,
            "Sidecar did not respond with allowed".to_string(),
        )
        .await;
        return Ok(Handshake::Denied);
    }

    // Release the pod's finalizer before asking for the actual delete.
    if has_finalizer(&pod, SERVER_FINALIZER) {
        remove_finalizer(pods, &pod, SERVER_FINALIZER).await?;
        emit(
            recorder,
            EventType::Normal,
            EventReason::ServerDeletionAllowed,
            "Pod finalizer removed".to_string(),
        )
        .await;
    }
    match pods.delete(&pod_name(&name), &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(err) => return Err(err.into()),
    }

    let mut status = server.status.clone().unwrap_or_default();
    if set_condition(
        &mut status.conditions,
        "Finalizing",
        "True",
        "PodDeleted",
        "Pod successfully deleted during finalization",
    ) {
        patch_status(servers, &name, &status).await?;
    }
    emit(
        recorder,
        EventType::Normal,
        EventReason::ServerPodDeleted,
        "Pod successfully deleted during finalization".to_string(),
    )
    .await;
    Ok(Handshake::Complete)
}

async fn patch_status(api: &Api<Server>, name: &str, status: &ServerStatus) -> Result<(), Error> {
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

#[instrument(skip_all)]
fn error_policy(_object: Arc<Server>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, "error occured on server reconcile loop");
    Action::requeue(Duration::from_secs(10))
}

#[instrument(skip_all)]
pub async fn run(ctx: Arc<Context>) -> Result<(), Error> {
    let servers = Api::<Server>::all(ctx.client.clone());
    let pods = Api::<Pod>::all(ctx.client.clone());

    let stream = Controller::new(servers, watcher::Config::default().any_semantic())
        .owns(pods, watcher::Config::default())
        .with_config(ControllerConfig::default().concurrency(10))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx);
    let mut stream = std::pin::pin!(stream);

    info!("starting up server controller loop");
    while let Some(res) = stream.next().await {
        if let Err(e) = res {
            error!(error = ?e, "error occured on server controller loop");
        }
    }
    info!("server controller has been terminated");
    Ok(())
}

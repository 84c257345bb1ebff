use std::{sync::Arc, time::Duration};

use kube::{
    api::{Patch, PatchParams},
    runtime::{controller::Action, events::EventType, watcher, Controller},
    Api, ResourceExt,
};
use tokio_stream::StreamExt;
use tracing::{error, info, instrument};

use crate::{
    controller::Context,
    crd::{GameType, GameTypeAutoscaler},
    error::Error,
    events::{emit, EventReason},
};

/// The closed set of supported strategies. Values are validated every pass so
/// a misconfigured autoscaler keeps reporting the same event until fixed.
pub const POLICY_WEBHOOK: &str = "webhook";
pub const SYNC_FIXED_INTERVAL: &str = "fixedinterval";

#[instrument(skip_all, fields(autoscaler = %autoscaler.name_any()))]
async fn reconcile(
    autoscaler: Arc<GameTypeAutoscaler>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let ns = autoscaler.namespace().unwrap();
    let game_types: Api<GameType> = Api::namespaced(ctx.client.clone(), &ns);
    let recorder = ctx.recorder(autoscaler.as_ref());

    let target = &autoscaler.spec.game_type_name;
    let Some(game_type) = game_types.get_opt(target).await? else {
        emit(
            &recorder,
            EventType::Warning,
            EventReason::AutoscalerMissingTarget,
            format!("Failed to find gametype {target}"),
        )
        .await;
        return Err(Error::MissingGameType(target.clone()));
    };

    let policy = &autoscaler.spec.policy.r#type;
    if policy != POLICY_WEBHOOK {
        emit(
            &recorder,
            EventType::Warning,
            EventReason::AutoscalerInvalidPolicy,
            format!("{policy} is not a valid autoscale policy type"),
        )
        .await;
        return Err(Error::UnsupportedPolicy(policy.clone()));
    }
    let sync = &autoscaler.spec.sync.r#type;
    if sync != SYNC_FIXED_INTERVAL {
        emit(
            &recorder,
            EventType::Warning,
            EventReason::AutoscalerInvalidSync,
            format!("{sync} is not a valid sync type"),
        )
        .await;
        return Err(Error::UnsupportedSync(sync.clone()));
    }

    let decision = match ctx.decision.compute(&autoscaler, &game_type).await {
        Ok(decision) => decision,
        Err(err) => {
            emit(
                &recorder,
                EventType::Warning,
                EventReason::AutoscalerDecisionFailed,
                format!("failed to compute scale decision: {err}"),
            )
            .await;
            return Err(err);
        }
    };

    let interval = Duration::from_secs(autoscaler.spec.sync.interval_seconds);
    if !decision.scale {
        return Ok(Action::requeue(interval));
    }

    let patch = serde_json::json!({
        "spec": { "fleet": { "scaling": { "replicas": decision.desired_replicas } } }
    });
    if let Err(err) = game_types
        .patch(target, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        emit(
            &recorder,
            EventType::Warning,
            EventReason::AutoscalerScale,
            "failed to update the gametype".to_string(),
        )
        .await;
        return Err(err.into());
    }
    emit(
        &recorder,
        EventType::Normal,
        EventReason::AutoscalerScale,
        format!("Scaling gametype to {}", decision.desired_replicas),
    )
    .await;

    Ok(Action::requeue(interval))
}

#[instrument(skip_all)]
fn error_policy(_object: Arc<GameTypeAutoscaler>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, "error occured on autoscaler reconcile loop");
    Action::requeue(Duration::from_secs(10))
}

#[instrument(skip_all)]
pub async fn run(ctx: Arc<Context>) -> Result<(), Error> {
    let autoscalers = Api::<GameTypeAutoscaler>::all(ctx.client.clone());

    let stream = Controller::new(autoscalers, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx);
    let mut stream = std::pin::pin!(stream);

    info!("starting up autoscaler controller loop");
    while let Some(res) = stream.next().await {
        if let Err(e) = res {
            error!(error = ?e, "error occured on autoscaler controller loop");
        }
    }
    info!("autoscaler controller has been terminated");
    Ok(())
}

use kube::runtime::events::{Event, EventType, Recorder};
use tracing::warn;

/// Closed set of reason codes attached to the events the controllers emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventReason {
    ServerInitialized,
    ServerDeletionAllowed,
    ServerDeletionDenied,
    ServerPodDeleted,
    ServerPodCreationFailed,
    ServerUpdateFailed,

    FleetInitialized,
    FleetUpdateFailed,
    FleetDrained,
    FleetScale,

    GameTypeInitialized,
    GameTypeDeleting,
    GameTypeDrained,
    GameTypeSpecUpdated,
    GameTypeReplicasUpdated,

    AutoscalerMissingTarget,
    AutoscalerInvalidPolicy,
    AutoscalerInvalidSync,
    AutoscalerDecisionFailed,
    AutoscalerScale,
}

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::ServerInitialized => "ServerInitialized",
            EventReason::ServerDeletionAllowed => "ServerDeletionAllowed",
            EventReason::ServerDeletionDenied => "ServerDeletionDenied",
            EventReason::ServerPodDeleted => "ServerPodDeleted",
            EventReason::ServerPodCreationFailed => "ServerPodCreationFailed",
            EventReason::ServerUpdateFailed => "ServerUpdateFailed",
            EventReason::FleetInitialized => "FleetInitialized",
            EventReason::FleetUpdateFailed => "FleetUpdateFailed",
            EventReason::FleetDrained => "FleetDrained",
            EventReason::FleetScale => "FleetScale",
            EventReason::GameTypeInitialized => "GameTypeInitialized",
            EventReason::GameTypeDeleting => "GameTypeDeleting",
            EventReason::GameTypeDrained => "GameTypeDrained",
            EventReason::GameTypeSpecUpdated => "GameTypeSpecUpdated",
            EventReason::GameTypeReplicasUpdated => "GameTypeReplicasUpdated",
            EventReason::AutoscalerMissingTarget => "AutoscalerMissingTarget",
            EventReason::AutoscalerInvalidPolicy => "AutoscalerInvalidPolicy",
            EventReason::AutoscalerInvalidSync => "AutoscalerInvalidSync",
            EventReason::AutoscalerDecisionFailed => "AutoscalerDecisionFailed",
            EventReason::AutoscalerScale => "AutoscalerScale",
        }
    }
}

/// Publishes an event, logging instead of failing when the API server refuses
/// it. Eventing is observability only and must never fail a reconcile.
pub async fn emit(recorder: &Recorder, type_: EventType, reason: EventReason, note: String) {
    let event = Event {
        type_,
        reason: reason.as_str().to_string(),
        note: Some(note),
        action: reason.as_str().to_string(),
        secondary: None,
    };
    if let Err(error) = recorder.publish(event).await {
        warn!(%error, reason = reason.as_str(), "failed to publish event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reasons_are_stable_identifiers() {
        // These strings end up in `kubectl describe` output and operator
        // dashboards; renaming one is a breaking change.
        assert_eq!(EventReason::ServerDeletionDenied.as_str(), "ServerDeletionDenied");
        assert_eq!(EventReason::FleetScale.as_str(), "FleetScale");
        assert_eq!(EventReason::AutoscalerInvalidPolicy.as_str(), "AutoscalerInvalidPolicy");
    }
}

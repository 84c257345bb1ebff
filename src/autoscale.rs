//! External decision source for the autoscaler.
//!
//! The reconcile state machine only knows the [`ScaleDecision`] capability;
//! the webhook transport below is one implementation, so new strategies can
//! be added without touching the controller.

use async_trait::async_trait;
use hyper::client::HttpConnector;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::{
    crd::{GameType, GameTypeAutoscaler, WebhookPolicy},
    error::Error,
};

/// Answer from a decision source.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscaleResponse {
    pub scale: bool,
    #[serde(default)]
    pub desired_replicas: i32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AutoscaleRequest<'a> {
    autoscaler: &'a str,
    namespace: &'a str,
    game_type: &'a str,
    current_replicas: i32,
}

/// Computes a scale decision from the autoscaler config and its target.
#[async_trait]
pub trait ScaleDecision: Send + Sync {
    async fn compute(
        &self,
        autoscaler: &GameTypeAutoscaler,
        game_type: &GameType,
    ) -> Result<AutoscaleResponse, Error>;
}

/// Resolves the decision endpoint: an explicit URL wins, otherwise the
/// in-cluster service DNS name is assembled from the service reference.
pub fn resolve_webhook_url(webhook: &WebhookPolicy) -> Result<String, Error> {
    let path = webhook.path.as_deref().unwrap_or("");
    if let Some(url) = &webhook.url {
        return Ok(format!("{}{path}", url.trim_end_matches('/')));
    }
    let service = webhook.service.as_ref().ok_or(Error::MissingWebhookTarget)?;
    Ok(format!(
        "http://{}.{}.svc:{}{path}",
        service.name, service.namespace, service.port
    ))
}

/// [`ScaleDecision`] implementation that POSTs the autoscaler context to the
/// configured webhook and decodes `{scale, desiredReplicas}`.
#[derive(Default)]
pub struct WebhookScaler {
    http: hyper::Client<HttpConnector>,
}

#[async_trait]
impl ScaleDecision for WebhookScaler {
    async fn compute(
        &self,
        autoscaler: &GameTypeAutoscaler,
        game_type: &GameType,
    ) -> Result<AutoscaleResponse, Error> {
        let url = resolve_webhook_url(&autoscaler.spec.policy.webhook)?;
        let uri: hyper::Uri = url.parse()?;
        let name = autoscaler.name_any();
        let namespace = autoscaler.namespace().unwrap_or_default();
        let target = game_type.name_any();
        let payload = AutoscaleRequest {
            autoscaler: &name,
            namespace: &namespace,
            game_type: &target,
            current_replicas: game_type.spec.fleet.scaling.replicas,
        };
        let body = serde_json::to_vec(&payload)?;
        let request = hyper::Request::post(uri)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(hyper::Body::from(body))?;
        let response = self.http.request(request).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::ScaleDecisionFailed(format!(
                "webhook answered with status {status}"
            )));
        }
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        let answer: AutoscaleResponse = serde_json::from_slice(&bytes)?;
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ServiceRef;

    #[test]
    fn explicit_url_wins_over_service() {
        let webhook = WebhookPolicy {
            url: Some("http://scaler.example.com/".to_string()),
            path: Some("/scale".to_string()),
            service: Some(ServiceRef {
                name: "scaler".to_string(),
                namespace: "default".to_string(),
                port: 8080,
            }),
        };
        assert_eq!(
            resolve_webhook_url(&webhook).unwrap(),
            "http://scaler.example.com/scale"
        );
    }

    #[test]
    fn service_reference_builds_cluster_dns_url() {
        let webhook = WebhookPolicy {
            url: None,
            path: Some("/scale".to_string()),
            service: Some(ServiceRef {
                name: "scaler".to_string(),
                namespace: "games".to_string(),
                port: 8080,
            }),
        };
        assert_eq!(
            resolve_webhook_url(&webhook).unwrap(),
            "http://scaler.games.svc:8080/scale"
        );
    }

    #[test]
    fn missing_target_is_an_error() {
        assert!(matches!(
            resolve_webhook_url(&WebhookPolicy::default()),
            Err(Error::MissingWebhookTarget)
        ));
    }

    #[test]
    fn decodes_decision_payload() {
        let answer: AutoscaleResponse =
            serde_json::from_str(r#"{"scale":true,"desiredReplicas":7}"#).unwrap();
        assert_eq!(answer, AutoscaleResponse { scale: true, desired_replicas: 7 });
    }
}

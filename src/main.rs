use std::sync::Arc;

use kube::{runtime::events::Reporter, Client};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gameserver_operator::{
    agent::SidecarClient,
    autoscale::WebhookScaler,
    controller::{self, Context, FIELD_MANAGER_NAME},
    error::Error,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");

    let ctx = Context {
        client,
        reporter: Reporter {
            controller: FIELD_MANAGER_NAME.into(),
            instance: std::env::var("HOSTNAME").ok(),
        },
        deletion: Arc::new(SidecarClient::default()),
        decision: Arc::new(WebhookScaler::default()),
        error_on_denied: std::env::var("ERROR_ON_DENIED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false),
    };

    info!("starting gameserver-operator");
    controller::run(ctx).await
}

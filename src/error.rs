#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Http Error: {0}")]
    HttpError(#[from] hyper::Error),

    #[error("Request Error: {0}")]
    RequestError(#[from] hyper::http::Error),

    #[error("Invalid Uri: {0}")]
    InvalidUri(#[from] hyper::http::uri::InvalidUri),

    #[error("pod {0} has no address to reach its sidecar")]
    MissingPodAddress(String),

    #[error("sidecar for pod {pod} answered with status {status}")]
    SidecarStatus { pod: String, status: u16 },

    #[error("deletion of server {0} is not allowed")]
    DeletionDenied(String),

    #[error("gametype {0} not found")]
    MissingGameType(String),

    #[error("{0} is not a valid autoscale policy type")]
    UnsupportedPolicy(String),

    #[error("{0} is not a valid sync type, currently only fixedinterval is supported")]
    UnsupportedSync(String),

    #[error("webhook policy has neither url nor service configured")]
    MissingWebhookTarget,

    #[error("autoscale webhook failed: {0}")]
    ScaleDecisionFailed(String),
}

//! Client side of the sidecar agent contract.
//!
//! Every running game server has a colocated sidecar answering
//! `GET /allow_delete` and accepting `POST /shutdown`. The operator never
//! deletes a running server without this handshake; a transport failure is
//! treated as "not allowed" by propagating the error (fail closed).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::client::HttpConnector;
use k8s_openapi::api::core::v1::Pod;
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{crd::Server, error::Error};

#[derive(Deserialize)]
struct AllowDeleteResponse {
    allowed: bool,
}

#[derive(Serialize)]
struct ShutdownRequest {
    shutdown: bool,
}

/// Capability deciding whether a Server may be deleted right now.
///
/// Injected into the controllers so tests can substitute a double for the
/// network round trip.
#[async_trait]
pub trait DeletionCheck: Send + Sync {
    /// The full handshake, used when a deletion is actually in progress:
    /// commands the server to start shutting down, then asks.
    async fn is_deletion_allowed(&self, server: &Server, pod: &Pod) -> Result<bool, Error>;

    /// Read-only variant for victim preference during scale-down. Must not
    /// command a shutdown; the asked server may well be one that survives.
    async fn query_deletion_allowed(&self, server: &Server, pod: &Pod) -> Result<bool, Error>;
}

/// The part of the deletion verdict that needs no network call.
///
/// Returns `Some(true)` when deletion is unconditionally permitted (pod not
/// running, force-delete set, or the grace timeout elapsed) and `None` when
/// the sidecar has to be asked.
pub fn local_verdict(server: &Server, pod: &Pod, now: DateTime<Utc>) -> Option<bool> {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if phase != Some("Running") {
        // Nothing to drain.
        return Some(true);
    }
    if server.spec.allow_force_delete {
        return Some(true);
    }
    if let (Some(timeout), Some(requested)) = (
        server.spec.timeout_seconds,
        server.meta().deletion_timestamp.as_ref(),
    ) {
        // The timeout overrides sidecar refusal so a drain cannot get stuck.
        if requested.0 + chrono::Duration::seconds(timeout) <= now {
            return Some(true);
        }
    }
    None
}

/// HTTP implementation of [`DeletionCheck`] talking to the sidecar over the
/// pod IP.
#[derive(Default)]
pub struct SidecarClient {
    http: hyper::Client<HttpConnector>,
}

impl SidecarClient {
    fn base_url(pod: &Pod, port: u16) -> Result<String, Error> {
        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .ok_or_else(|| Error::MissingPodAddress(pod.name_any()))?;
        Ok(format!("http://{ip}:{port}"))
    }

    async fn request_shutdown(&self, pod: &Pod, port: u16) -> Result<(), Error> {
        let uri: hyper::Uri = format!("{}/shutdown", Self::base_url(pod, port)?).parse()?;
        let body = serde_json::to_vec(&ShutdownRequest { shutdown: true })?;
        let request = hyper::Request::post(uri)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(hyper::Body::from(body))?;
        let response = self.http.request(request).await?;
        if !response.status().is_success() {
            return Err(Error::SidecarStatus {
                pod: pod.name_any(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    async fn allow_delete(&self, pod: &Pod, port: u16) -> Result<bool, Error> {
        let uri: hyper::Uri = format!("{}/allow_delete", Self::base_url(pod, port)?).parse()?;
        let response = self.http.get(uri).await?;
        if !response.status().is_success() {
            return Err(Error::SidecarStatus {
                pod: pod.name_any(),
                status: response.status().as_u16(),
            });
        }
        let bytes = hyper::body::to_bytes(response.into_body()).await?;
        let answer: AllowDeleteResponse = serde_json::from_slice(&bytes)?;
        Ok(answer.allowed)
    }
}

#[async_trait]
impl DeletionCheck for SidecarClient {
    async fn is_deletion_allowed(&self, server: &Server, pod: &Pod) -> Result<bool, Error> {
        if let Some(verdict) = local_verdict(server, pod, Utc::now()) {
            return Ok(verdict);
        }
        let port = server.spec.sidecar.port;
        // Tell the server to start shutting down first, then ask whether it
        // is already safe to remove it.
        self.request_shutdown(pod, port).await?;
        let allowed = self.allow_delete(pod, port).await?;
        debug!(server = %server.name_any(), allowed, "sidecar answered deletion check");
        Ok(allowed)
    }

    async fn query_deletion_allowed(&self, server: &Server, pod: &Pod) -> Result<bool, Error> {
        if let Some(verdict) = local_verdict(server, pod, Utc::now()) {
            return Ok(verdict);
        }
        let allowed = self.allow_delete(pod, server.spec.sidecar.port).await?;
        debug!(server = %server.name_any(), allowed, "sidecar answered advisory query");
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Read, Write},
        net::{TcpListener, TcpStream},
        sync::{Arc, Mutex},
        thread,
    };

    use super::*;
    use crate::crd::ServerSpec;
    use chrono::TimeZone;
    use k8s_openapi::{api::core::v1::PodStatus, apimachinery::pkg::apis::meta::v1::Time};

    fn running_pod() -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some("10.0.0.7".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn server(spec: ServerSpec) -> Server {
        Server::new("game-0", spec)
    }

    #[test]
    fn pod_not_running_is_always_deletable() {
        let pod = Pod::default();
        let server = server(ServerSpec::default());
        assert_eq!(local_verdict(&server, &pod, Utc::now()), Some(true));
    }

    #[test]
    fn force_delete_bypasses_the_sidecar() {
        let server = server(ServerSpec {
            allow_force_delete: true,
            ..Default::default()
        });
        assert_eq!(local_verdict(&server, &running_pod(), Utc::now()), Some(true));
    }

    #[test]
    fn elapsed_grace_timeout_overrides_refusal() {
        let mut server = server(ServerSpec {
            timeout_seconds: Some(300),
            ..Default::default()
        });
        let requested = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        server.metadata.deletion_timestamp = Some(Time(requested));

        let before = requested + chrono::Duration::seconds(299);
        let after = requested + chrono::Duration::seconds(300);
        assert_eq!(local_verdict(&server, &running_pod(), before), None);
        assert_eq!(local_verdict(&server, &running_pod(), after), Some(true));
    }

    #[test]
    fn running_server_without_overrides_must_ask_the_sidecar() {
        let server = server(ServerSpec::default());
        assert_eq!(local_verdict(&server, &running_pod(), Utc::now()), None);
    }

    /// Minimal sidecar standing on a loopback port, recording every request
    /// line it sees and always answering `{"allowed": true}`.
    fn spawn_sidecar_double() -> (u16, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let seen = Arc::clone(&seen);
                thread::spawn(move || serve_sidecar(stream, seen));
            }
        });
        (port, requests)
    }

    fn serve_sidecar(stream: TcpStream, seen: Arc<Mutex<Vec<String>>>) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut stream = stream;
        loop {
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
                return;
            }
            let mut content_length = 0usize;
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).unwrap_or(0) == 0 {
                    return;
                }
                if header == "\r\n" {
                    break;
                }
                if let Some(value) = header.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
            let mut body = vec![0; content_length];
            if reader.read_exact(&mut body).is_err() {
                return;
            }
            seen.lock().unwrap().push(request_line.trim_end().to_string());
            let payload = if request_line.starts_with("GET /allow_delete") {
                r#"{"allowed":true}"#
            } else {
                ""
            };
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{payload}",
                payload.len()
            );
            if stream.write_all(response.as_bytes()).is_err() {
                return;
            }
        }
    }

    fn local_pod(port: u16) -> (Server, Pod) {
        let mut server = server(ServerSpec::default());
        server.spec.sidecar.port = port;
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some("127.0.0.1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        (server, pod)
    }

    #[tokio::test]
    async fn advisory_query_never_commands_shutdown() {
        let (port, requests) = spawn_sidecar_double();
        let (server, pod) = local_pod(port);

        let allowed = SidecarClient::default()
            .query_deletion_allowed(&server, &pod)
            .await
            .unwrap();

        assert!(allowed);
        let seen = requests.lock().unwrap().clone();
        assert_eq!(seen, vec!["GET /allow_delete HTTP/1.1".to_string()]);
    }

    #[tokio::test]
    async fn deletion_handshake_commands_shutdown_before_asking() {
        let (port, requests) = spawn_sidecar_double();
        let (server, pod) = local_pod(port);

        let allowed = SidecarClient::default()
            .is_deletion_allowed(&server, &pod)
            .await
            .unwrap();

        assert!(allowed);
        let seen = requests.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "POST /shutdown HTTP/1.1".to_string(),
                "GET /allow_delete HTTP/1.1".to_string(),
            ]
        );
    }
}

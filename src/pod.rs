use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, LocalObjectReference, ObjectFieldSelector,
    Pod, PodSpec,
};
use kube::{api::ObjectMeta, Resource, ResourceExt};

use crate::crd::{Server, FLEET_LABEL, GAME_TYPE_LABEL, SERVER_LABEL};

pub const SIDECAR_CONTAINER_NAME: &str = "gameserver-sidecar";

/// Name of the Pod backing a Server.
pub fn pod_name(server_name: &str) -> String {
    format!("{server_name}-pod")
}

/// Builds the Pod for a Server: the declared containers plus the sidecar,
/// with the identity env vars every container gets.
pub fn pod_for_server(server: &Server) -> Pod {
    let mut labels: BTreeMap<String, String> = server.labels().clone();
    labels.insert(SERVER_LABEL.to_string(), server.name_any());

    let mut metadata = ObjectMeta {
        name: Some(pod_name(&server.name_any())),
        namespace: server.namespace(),
        labels: Some(labels),
        ..Default::default()
    };
    if let Some(oref) = server.controller_owner_ref(&()) {
        metadata.owner_references = Some(vec![oref]);
    }

    Pod {
        metadata,
        spec: Some(pod_spec(server)),
        ..Default::default()
    }
}

fn pod_spec(server: &Server) -> PodSpec {
    let sidecar = &server.spec.sidecar;
    let mut spec = server.spec.pod.clone();
    spec.containers.push(Container {
        name: SIDECAR_CONTAINER_NAME.to_string(),
        image: Some(sidecar.image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: i32::from(sidecar.port),
            ..Default::default()
        }]),
        env: Some(vec![env_value("SERVER_PORT", sidecar.port.to_string())]),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ..Default::default()
    });

    for container in &mut spec.containers {
        let env = container.env.get_or_insert_with(Vec::new);
        env.push(env_value(
            "CONTAINER_IMAGE",
            container.image.clone().unwrap_or_default(),
        ));
        env.push(env_value("SERVER_NAME", server.name_any()));
        if let Some(fleet) = server.labels().get(FLEET_LABEL) {
            env.push(env_value("FLEET_NAME", fleet.clone()));
        }
        if let Some(game) = server.labels().get(GAME_TYPE_LABEL) {
            env.push(env_value("GAME_NAME", game.clone()));
        }
        env.push(env_field_ref("POD_IP", "status.podIP"));
        env.push(env_field_ref("NODE_NAME", "spec.nodeName"));
    }

    if let Ok(secret) = std::env::var("IMAGE_PULL_SECRET_NAME") {
        if !secret.is_empty() {
            spec.image_pull_secrets
                .get_or_insert_with(Vec::new)
                .push(LocalObjectReference { name: Some(secret) });
        }
    }

    spec
}

fn env_value(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    }
}

fn env_field_ref(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ServerSpec;

    fn server() -> Server {
        let mut server = Server::new(
            "lobby-1",
            ServerSpec {
                pod: PodSpec {
                    containers: vec![Container {
                        name: "game".to_string(),
                        image: Some("arcadia/lobby:4".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        server.metadata.namespace = Some("default".to_string());
        server.metadata.uid = Some("b5c2a7d0".to_string());
        server
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(FLEET_LABEL.to_string(), "lobby-fleet".to_string());
        server
    }

    #[test]
    fn appends_sidecar_container() {
        let pod = pod_for_server(&server());
        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers.len(), 2);
        let sidecar = spec
            .containers
            .iter()
            .find(|c| c.name == SIDECAR_CONTAINER_NAME)
            .unwrap();
        assert_eq!(sidecar.image.as_deref(), Some("arcadia/gameserver-sidecar:latest"));
        assert_eq!(sidecar.ports.as_ref().unwrap()[0].container_port, 8080);
    }

    #[test]
    fn every_container_gets_identity_env() {
        let pod = pod_for_server(&server());
        for container in pod.spec.unwrap().containers {
            let env = container.env.unwrap();
            let names: Vec<_> = env.iter().map(|e| e.name.as_str()).collect();
            assert!(names.contains(&"SERVER_NAME"));
            assert!(names.contains(&"FLEET_NAME"));
            assert!(names.contains(&"POD_IP"));
            assert!(names.contains(&"NODE_NAME"));
        }
    }

    #[test]
    fn pod_carries_server_label_and_owner() {
        let pod = pod_for_server(&server());
        assert_eq!(pod.metadata.name.as_deref(), Some("lobby-1-pod"));
        assert_eq!(
            pod.metadata.labels.unwrap().get(SERVER_LABEL).map(String::as_str),
            Some("lobby-1")
        );
        let orefs = pod.metadata.owner_references.unwrap();
        assert_eq!(orefs[0].kind, "Server");
        assert_eq!(orefs[0].name, "lobby-1");
    }
}

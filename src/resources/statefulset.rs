//! Server workload generation
//!
//! Builds the StatefulSet running the identity-server cluster. The pod
//! template is derived entirely from the IdentityServer spec; the optional
//! user pod template is merged additively and may never change the identity
//! of the server container.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, PodSpec, PodTemplateSpec,
    Probe, ResourceRequirements, SecretKeySelector, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use kube::ResourceExt;

use crate::crd::{IdentityServer, WorkloadResources};
use crate::resources::naming::{
    admin_secret_name, discovery_service_name, owner_reference, selector_labels, standard_labels,
    statefulset_name, UPDATE_HASH_ANNOTATION,
};

/// Default identity-server image, overridable through the spec
pub const DEFAULT_IMAGE: &str = "quay.io/example/identity-server:24.0";

/// Name of the server container inside the pod
pub const SERVER_CONTAINER: &str = "identity-server";

/// Port used for cluster member discovery (headless service)
pub const DISCOVERY_PORT: i32 = 7800;

/// Management port serving health endpoints
pub const MANAGEMENT_PORT: i32 = 9000;

/// Mount path for the TLS server certificate
const TLS_MOUNT_PATH: &str = "/mnt/certificates";

/// Resolved server image for a primary
pub fn server_image(server: &IdentityServer) -> String {
    server
        .spec
        .image
        .clone()
        .unwrap_or_else(|| DEFAULT_IMAGE.to_string())
}

/// Generate the server StatefulSet
///
/// `update_hash` identifies the update-relevant portion of the spec and is
/// stamped on the pod template so a later pass can tell whether the running
/// workload corresponds to the currently declared one.
pub fn generate_statefulset(server: &IdentityServer, update_hash: &str) -> StatefulSet {
    let name = statefulset_name(server);
    let server_name = server.name_any();
    let ns = server.namespace();
    let labels = standard_labels(&server_name);
    let instances = server.spec.instances.unwrap_or(1);

    let mut pod_labels = selector_labels(&server_name);
    let mut pod_annotations = BTreeMap::from([(
        UPDATE_HASH_ANNOTATION.to_string(),
        update_hash.to_string(),
    )]);

    let mut volumes: Vec<Volume> = Vec::new();
    let mut mounts: Vec<VolumeMount> = Vec::new();

    let http = server.spec.http.as_ref();
    if let Some(tls_secret) = http.and_then(|h| h.tls_secret.as_deref()) {
        volumes.push(Volume {
            name: "tls-certificates".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(tls_secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "tls-certificates".to_string(),
            mount_path: TLS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    let mut container = Container {
        name: SERVER_CONTAINER.to_string(),
        image: Some(server_image(server)),
        ports: Some(container_ports(server)),
        env: Some(server_env(server)),
        volume_mounts: if mounts.is_empty() {
            None
        } else {
            Some(mounts)
        },
        readiness_probe: Some(http_probe(
            "/health/ready",
            server
                .spec
                .probes
                .as_ref()
                .and_then(|p| p.readiness_period_seconds),
        )),
        liveness_probe: Some(http_probe(
            "/health/live",
            server
                .spec
                .probes
                .as_ref()
                .and_then(|p| p.liveness_period_seconds),
        )),
        ..Default::default()
    };

    if let Some(ref resources) = server.spec.resources {
        container.resources = Some(convert_resources(resources));
    }

    let mut pod_spec = PodSpec {
        containers: vec![container],
        volumes: if volumes.is_empty() {
            None
        } else {
            Some(volumes)
        },
        ..Default::default()
    };

    if let Some(ref scheduling) = server.spec.scheduling {
        if !scheduling.node_selector.is_empty() {
            pod_spec.node_selector = Some(scheduling.node_selector.clone());
        }
        pod_spec.priority_class_name = scheduling.priority_class.clone();
    }

    merge_pod_template_overrides(server, &mut pod_labels, &mut pod_annotations, &mut pod_spec);

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: ns,
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(server)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(instances),
            service_name: Some(discovery_service_name(server)),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&server_name)),
                ..Default::default()
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                rolling_update: Some(RollingUpdateStatefulSetStrategy::default()),
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(pod_annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Container ports for the server
fn container_ports(server: &IdentityServer) -> Vec<ContainerPort> {
    let http = server.spec.http.as_ref();
    let https_port = http.map(|h| h.https_port).unwrap_or(8443);

    let mut ports = vec![
        ContainerPort {
            name: Some("https".to_string()),
            container_port: https_port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        },
        ContainerPort {
            name: Some("management".to_string()),
            container_port: MANAGEMENT_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        },
        ContainerPort {
            name: Some("discovery".to_string()),
            container_port: DISCOVERY_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        },
    ];

    if http.map(|h| h.http_enabled).unwrap_or(false) {
        ports.insert(
            0,
            ContainerPort {
                name: Some("http".to_string()),
                container_port: http.map(|h| h.http_port).unwrap_or(8080),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        );
    }

    ports
}

/// Environment for the server container
fn server_env(server: &IdentityServer) -> Vec<EnvVar> {
    let http = server.spec.http.as_ref();
    let admin_secret = server
        .spec
        .bootstrap_admin
        .as_ref()
        .and_then(|b| b.secret.clone())
        .unwrap_or_else(|| admin_secret_name(server));

    let mut env = vec![
        env_value(
            "IDP_CACHE_DISCOVERY_SERVICE",
            &format!(
                "{}.{}.svc",
                discovery_service_name(server),
                server.namespace().unwrap_or_else(|| "default".to_string())
            ),
        ),
        env_value(
            "IDP_HTTPS_PORT",
            &http.map(|h| h.https_port).unwrap_or(8443).to_string(),
        ),
        env_secret("IDP_BOOTSTRAP_ADMIN_USERNAME", &admin_secret, "username"),
        env_secret("IDP_BOOTSTRAP_ADMIN_PASSWORD", &admin_secret, "password"),
    ];

    if http.map(|h| h.http_enabled).unwrap_or(false) {
        env.push(env_value("IDP_HTTP_ENABLED", "true"));
        env.push(env_value(
            "IDP_HTTP_PORT",
            &http.map(|h| h.http_port).unwrap_or(8080).to_string(),
        ));
    }

    if http.and_then(|h| h.tls_secret.as_ref()).is_some() {
        env.push(env_value(
            "IDP_HTTPS_CERTIFICATE_FILE",
            &format!("{}/tls.crt", TLS_MOUNT_PATH),
        ));
        env.push(env_value(
            "IDP_HTTPS_CERTIFICATE_KEY_FILE",
            &format!("{}/tls.key", TLS_MOUNT_PATH),
        ));
    }

    for option in &server.spec.additional_options {
        env.push(env_value(&option_env_name(&option.name), &option.value));
    }

    env
}

/// Render a server option name as its environment variable form
fn option_env_name(option: &str) -> String {
    format!("IDP_{}", option.to_uppercase().replace('-', "_"))
}

fn env_value(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn env_secret(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

/// HTTP probe against the management port
fn http_probe(path: &str, period_seconds: Option<i32>) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(MANAGEMENT_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        period_seconds,
        ..Default::default()
    }
}

/// Convert the simplified resource model into the Kubernetes one
fn convert_resources(resources: &WorkloadResources) -> ResourceRequirements {
    let to_map = |list: &crate::crd::ResourceList| {
        let mut map = BTreeMap::new();
        if let Some(ref cpu) = list.cpu {
            map.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(ref memory) = list.memory {
            map.insert("memory".to_string(), Quantity(memory.clone()));
        }
        map
    };

    ResourceRequirements {
        limits: resources.limits.as_ref().map(to_map),
        requests: resources.requests.as_ref().map(to_map),
        ..Default::default()
    }
}

/// Merge the additive parts of the user pod template into the generated pod
///
/// Identity-affecting fields are deliberately ignored here; the status
/// aggregation reports them through [`pod_template_violations`].
fn merge_pod_template_overrides(
    server: &IdentityServer,
    pod_labels: &mut BTreeMap<String, String>,
    pod_annotations: &mut BTreeMap<String, String>,
    pod_spec: &mut PodSpec,
) {
    let Some(ref template) = server.spec.pod_template else {
        return;
    };

    if let Some(ref meta) = template.metadata {
        if let Some(ref labels) = meta.labels {
            for (k, v) in labels {
                pod_labels.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        if let Some(ref annotations) = meta.annotations {
            for (k, v) in annotations {
                pod_annotations
                    .entry(k.clone())
                    .or_insert_with(|| v.clone());
            }
        }
    }

    let Some(ref spec) = template.spec else {
        return;
    };

    if let Some(ref volumes) = spec.volumes {
        pod_spec
            .volumes
            .get_or_insert_with(Vec::new)
            .extend(volumes.iter().cloned());
    }

    // Additional sidecar containers; the server container itself is not
    // replaceable, matching containers are dropped
    for extra in spec.containers.iter().skip(1) {
        if extra.name != SERVER_CONTAINER {
            pod_spec.containers.push(extra.clone());
        }
    }

    if let Some(ref affinity) = spec.affinity {
        pod_spec.affinity = Some(affinity.clone());
    }
    if let Some(ref tolerations) = spec.tolerations {
        pod_spec.tolerations = Some(tolerations.clone());
    }
}

/// Unsupported pod-template override fields set by the user
///
/// Each entry becomes a Warning on the primary's status; the values are
/// accepted structurally but never applied to the workload.
pub fn pod_template_violations(server: &IdentityServer) -> Vec<String> {
    let mut violations = Vec::new();
    let Some(ref template) = server.spec.pod_template else {
        return violations;
    };

    if let Some(ref meta) = template.metadata {
        if meta.name.is_some() {
            violations.push("pod template metadata name cannot be modified".to_string());
        }
        if meta.namespace.is_some() {
            violations.push("pod template metadata namespace cannot be modified".to_string());
        }
    }

    if let Some(ref spec) = template.spec {
        if let Some(first) = spec.containers.first() {
            if !first.name.is_empty() && first.name != SERVER_CONTAINER {
                violations.push("first container name cannot be modified".to_string());
            }
            if first.image.is_some() {
                violations.push("first container image cannot be modified".to_string());
            }
            if first.resources.is_some() {
                violations.push("first container resources cannot be modified".to_string());
            }
        }
        if spec.image_pull_secrets.is_some() {
            violations.push("image pull secrets cannot be modified".to_string());
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta as KubeObjectMeta;

    fn server() -> IdentityServer {
        IdentityServer {
            metadata: KubeObjectMeta {
                name: Some("example".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid".to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    #[test]
    fn test_statefulset_basics() {
        let mut s = server();
        s.spec.instances = Some(3);
        let sts = generate_statefulset(&s, "abc123");

        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name.as_deref(), Some("example-discovery"));

        let annotations = spec.template.metadata.unwrap().annotations.unwrap();
        assert_eq!(
            annotations.get(UPDATE_HASH_ANNOTATION),
            Some(&"abc123".to_string())
        );

        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.name, SERVER_CONTAINER);
        assert_eq!(container.image.as_deref(), Some(DEFAULT_IMAGE));
    }

    #[test]
    fn test_image_override_from_pod_template_is_not_applied() {
        let mut s = server();
        s.spec.pod_template = Some(PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: SERVER_CONTAINER.to_string(),
                    image: Some("evil:latest".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        });

        let sts = generate_statefulset(&s, "h");
        let container = &sts.spec.unwrap().template.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some(DEFAULT_IMAGE));

        let violations = pod_template_violations(&s);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("cannot be modified"));
    }

    #[test]
    fn test_pod_template_additive_merge() {
        let mut s = server();
        s.spec.pod_template = Some(PodTemplateSpec {
            metadata: Some(KubeObjectMeta {
                labels: Some(BTreeMap::from([(
                    "team".to_string(),
                    "identity".to_string(),
                )])),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![
                    Container {
                        name: SERVER_CONTAINER.to_string(),
                        ..Default::default()
                    },
                    Container {
                        name: "audit-forwarder".to_string(),
                        image: Some("audit:1".to_string()),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
        });

        let sts = generate_statefulset(&s, "h");
        let template = sts.spec.unwrap().template;
        let labels = template.metadata.unwrap().labels.unwrap();
        assert_eq!(labels.get("team"), Some(&"identity".to_string()));

        let containers = template.spec.unwrap().containers;
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[1].name, "audit-forwarder");
    }

    #[test]
    fn test_tls_secret_mounts_certificates() {
        let mut s = server();
        s.spec.http = Some(crate::crd::HttpSpec {
            http_enabled: false,
            http_port: 8080,
            https_port: 8443,
            tls_secret: Some("example-tls".to_string()),
        });

        let sts = generate_statefulset(&s, "h");
        let pod = sts.spec.unwrap().template.spec.unwrap();
        let volume = &pod.volumes.unwrap()[0];
        assert_eq!(
            volume.secret.as_ref().unwrap().secret_name.as_deref(),
            Some("example-tls")
        );

        let env = pod.containers[0].env.clone().unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "IDP_HTTPS_CERTIFICATE_FILE"));
    }

    #[test]
    fn test_additional_options_become_env() {
        let mut s = server();
        s.spec.additional_options = vec![crate::crd::ServerOption {
            name: "log-level".to_string(),
            value: "debug".to_string(),
        }];

        let sts = generate_statefulset(&s, "h");
        let env = sts.spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        assert!(env
            .iter()
            .any(|e| e.name == "IDP_LOG_LEVEL" && e.value.as_deref() == Some("debug")));
    }
}

//! Service generation for identity-server clusters
//!
//! Two services are managed per primary: a headless discovery service used by
//! the cluster transport to find peer members, and a public ClusterIP service
//! fronting client traffic.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use kube::ResourceExt;

use crate::crd::IdentityServer;
use crate::resources::naming::{
    discovery_service_name, owner_reference, selector_labels, service_name, standard_labels,
};
use crate::resources::statefulset::DISCOVERY_PORT;

/// Generate the headless discovery service
///
/// Publishes addresses for not-yet-ready pods so members can discover each
/// other while the cluster is still forming.
pub fn generate_discovery_service(server: &IdentityServer) -> Service {
    let server_name = server.name_any();

    Service {
        metadata: ObjectMeta {
            name: Some(discovery_service_name(server)),
            namespace: server.namespace(),
            labels: Some(standard_labels(&server_name)),
            owner_references: Some(vec![owner_reference(server)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(selector_labels(&server_name)),
            ports: Some(vec![ServicePort {
                name: Some("discovery".to_string()),
                port: DISCOVERY_PORT,
                target_port: Some(IntOrString::Int(DISCOVERY_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Generate the public client-facing service
pub fn generate_service(server: &IdentityServer) -> Service {
    let server_name = server.name_any();
    let http = server.spec.http.as_ref();
    let https_port = http.map(|h| h.https_port).unwrap_or(8443);

    let mut ports = vec![ServicePort {
        name: Some("https".to_string()),
        port: https_port,
        target_port: Some(IntOrString::Int(https_port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];

    if http.map(|h| h.http_enabled).unwrap_or(false) {
        let http_port = http.map(|h| h.http_port).unwrap_or(8080);
        ports.push(ServicePort {
            name: Some("http".to_string()),
            port: http_port,
            target_port: Some(IntOrString::Int(http_port)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }

    Service {
        metadata: ObjectMeta {
            name: Some(service_name(server)),
            namespace: server.namespace(),
            labels: Some(standard_labels(&server_name)),
            owner_references: Some(vec![owner_reference(server)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&server_name)),
            ports: Some(ports),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Port exposed by the public service for Ingress routing
pub fn public_port(server: &IdentityServer) -> i32 {
    let http = server.spec.http.as_ref();
    if http.map(|h| h.http_enabled).unwrap_or(false) {
        http.map(|h| h.http_port).unwrap_or(8080)
    } else {
        http.map(|h| h.https_port).unwrap_or(8443)
    }
}

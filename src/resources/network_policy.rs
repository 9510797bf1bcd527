//! NetworkPolicy generation for identity-server clusters
//!
//! Restricts ingress traffic to the server pods: client ports are reachable
//! from anywhere in the cluster, the discovery port only from cluster
//! members themselves.

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::ObjectMeta;
use kube::ResourceExt;

use crate::crd::IdentityServer;
use crate::resources::naming::{
    network_policy_name, owner_reference, selector_labels, standard_labels,
};
use crate::resources::statefulset::{DISCOVERY_PORT, MANAGEMENT_PORT};

fn tcp_port(port: i32) -> NetworkPolicyPort {
    NetworkPolicyPort {
        port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Generate the NetworkPolicy for the server pods
pub fn generate_network_policy(server: &IdentityServer) -> NetworkPolicy {
    let server_name = server.name_any();
    let http = server.spec.http.as_ref();

    let pod_selector = LabelSelector {
        match_labels: Some(selector_labels(&server_name)),
        ..Default::default()
    };

    let mut client_ports = vec![
        tcp_port(http.map(|h| h.https_port).unwrap_or(8443)),
        tcp_port(MANAGEMENT_PORT),
    ];
    if http.map(|h| h.http_enabled).unwrap_or(false) {
        client_ports.push(tcp_port(http.map(|h| h.http_port).unwrap_or(8080)));
    }

    let ingress_rules = vec![
        // Client and management traffic from any peer
        NetworkPolicyIngressRule {
            from: None,
            ports: Some(client_ports),
        },
        // Cluster transport only between members
        NetworkPolicyIngressRule {
            from: Some(vec![NetworkPolicyPeer {
                pod_selector: Some(pod_selector.clone()),
                ..Default::default()
            }]),
            ports: Some(vec![tcp_port(DISCOVERY_PORT)]),
        },
    ];

    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(network_policy_name(server)),
            namespace: server.namespace(),
            labels: Some(standard_labels(&server_name)),
            owner_references: Some(vec![owner_reference(server)]),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector,
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(ingress_rules),
            ..Default::default()
        }),
    }
}

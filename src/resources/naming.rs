//! Naming and metadata helpers shared by all resource builders
//!
//! Every child resource derives its name, labels and owner reference from
//! these functions so that builders never reach into each other.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::IdentityServer;

/// API version for the IdentityServer CRD
pub const API_VERSION: &str = "idp.example.com/v1alpha1";

/// Kind for the IdentityServer CRD
pub const KIND: &str = "IdentityServer";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "identity-operator";

/// Label carrying the cluster identity on every child resource
pub const CLUSTER_LABEL: &str = "idp.example.com/cluster";

/// Pod-template annotation carrying the update-compatibility hash
pub const UPDATE_HASH_ANNOTATION: &str = "idp.example.com/update-hash";

/// Workload annotation set by migration tooling while the server is scaled
/// down for a data migration
pub const MIGRATING_ANNOTATION: &str = "idp.example.com/migrating";

/// StatefulSet name for the server workload
pub fn statefulset_name(server: &IdentityServer) -> String {
    server.name_any()
}

/// Headless discovery service name (cluster transport)
pub fn discovery_service_name(server: &IdentityServer) -> String {
    format!("{}-discovery", server.name_any())
}

/// Public service name (client traffic)
pub fn service_name(server: &IdentityServer) -> String {
    format!("{}-service", server.name_any())
}

/// Ingress name
pub fn ingress_name(server: &IdentityServer) -> String {
    format!("{}-ingress", server.name_any())
}

/// NetworkPolicy name
pub fn network_policy_name(server: &IdentityServer) -> String {
    format!("{}-network-policy", server.name_any())
}

/// Generated bootstrap admin Secret name
pub fn admin_secret_name(server: &IdentityServer) -> String {
    format!("{}-initial-admin", server.name_any())
}

/// Monitoring descriptor name
pub fn monitoring_name(server: &IdentityServer) -> String {
    format!("{}-monitor", server.name_any())
}

/// Realm import Job name
pub fn realm_import_job_name(server: &IdentityServer) -> String {
    format!("{}-realm-import", server.name_any())
}

/// Update-compatibility probe Job name
pub fn update_job_name(server: &IdentityServer) -> String {
    format!("{}-update-check", server.name_any())
}

/// Generate standard labels for all resources belonging to an IdentityServer
pub fn standard_labels(server_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            server_name.to_string(),
        ),
        (
            "app.kubernetes.io/component".to_string(),
            "identity-server".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), server_name.to_string()),
    ])
}

/// Labels selecting the server pods, also used for the status selector string
pub fn selector_labels(server_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            server_name.to_string(),
        ),
        (CLUSTER_LABEL.to_string(), server_name.to_string()),
    ])
}

/// Render the pod selector as a label-selector string
pub fn selector_string(server_name: &str) -> String {
    selector_labels(server_name)
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Generate an owner reference for an IdentityServer
///
/// All child resources carry this reference so the cluster garbage collects
/// them when the primary is deleted.
pub fn owner_reference(server: &IdentityServer) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: server.name_any(),
        uid: server.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// IdentityServer is the Schema for the identityservers API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "idp.example.com",
    version = "v1alpha1",
    kind = "IdentityServer",
    plural = "identityservers",
    shortname = "idps",
    namespaced,
    status = "IdentityServerStatus",
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IdentityServerSpec {
    /// Server image. Falls back to the operator's pinned default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Number of server instances. Unset values are defaulted to 1 by the
    /// operator through a spec patch, so a later reconciliation always sees
    /// a concrete count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<i32>,

    /// HTTP/TLS listener configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpSpec>,

    /// Extra server configuration options, rendered as container environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_options: Vec<ServerOption>,

    /// Bootstrap admin account configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_admin: Option<BootstrapAdminSpec>,

    /// Ingress exposure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,

    /// NetworkPolicy generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<NetworkPolicySpec>,

    /// Monitoring descriptor generation (requires the ServiceMonitor CRD)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring: Option<MonitoringSpec>,

    /// Realm import from an external ConfigMap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm_import: Option<RealmImportSpec>,

    /// Resource requirements for server pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<WorkloadResources>,

    /// Scheduling hints for server pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<SchedulingSpec>,

    /// Health probe tuning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<ProbesSpec>,

    /// Update rollout policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateSpec>,

    /// Unstructured pod template override. Only additive fields (labels,
    /// annotations, extra volumes/containers, affinity, tolerations) are
    /// applied; identity-affecting fields are reported and ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "pod_template_schema")]
    pub pod_template: Option<PodTemplateSpec>,
}

/// The override is accepted structurally; validation happens at
/// reconciliation time where violations become status warnings
fn pod_template_schema(
    _: &mut schemars::r#gen::SchemaGenerator,
) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    }))
    .expect("static schema parses")
}

/// HTTP/TLS listener configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpSpec {
    /// Serve plain HTTP in addition to HTTPS
    #[serde(default)]
    pub http_enabled: bool,

    /// Plain HTTP port
    #[serde(default = "default_http_port")]
    pub http_port: i32,

    /// HTTPS port
    #[serde(default = "default_https_port")]
    pub https_port: i32,

    /// TLS server certificate Secret (tls.crt / tls.key). The Secret is
    /// referenced by name and tracked for drift, not owned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
}

fn default_http_port() -> i32 {
    8080
}

fn default_https_port() -> i32 {
    8443
}

/// A single server configuration option
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerOption {
    pub name: String,
    pub value: String,
}

/// Bootstrap admin account configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapAdminSpec {
    /// Existing Secret holding `username` and `password` keys. When unset the
    /// operator generates credentials into an owned Secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Ingress exposure configuration
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Generate an Ingress for the public service
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// IngressClass name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// Hostname for the Ingress rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Extra annotations merged onto the Ingress
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// TLS Secret for the Ingress rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
}

fn default_true() -> bool {
    true
}

/// NetworkPolicy generation toggle
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPolicySpec {
    pub enabled: bool,
}

/// Monitoring descriptor toggle
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSpec {
    pub enabled: bool,
}

/// Realm import from an external ConfigMap
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RealmImportSpec {
    /// Name of the ConfigMap holding the realm definition
    pub config_map: String,

    /// Key within the ConfigMap
    #[serde(default = "default_realm_key")]
    pub key: String,
}

fn default_realm_key() -> String {
    "realm.json".to_string()
}

/// Resource requirements for server pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// Resource quantities for CPU and memory
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Scheduling hints for server pods
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class: Option<String>,
}

/// Health probe tuning
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbesSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_period_seconds: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_period_seconds: Option<i32>,
}

/// Update rollout policy
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSpec {
    #[serde(default)]
    pub strategy: UpdateStrategy,
}

/// How workload spec changes are rolled out
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq)]
pub enum UpdateStrategy {
    /// Verify compatibility with a probe job before rolling forward
    #[default]
    Auto,
    /// Roll forward directly without a compatibility check
    Force,
}

/// Status of the IdentityServer
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityServerStatus {
    /// Whether the server is ready to accept traffic
    #[serde(default)]
    pub ready: bool,

    /// Generation last observed by the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Label selector for server pods, for scale subresource consumers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,

    /// Number of ready server instances
    #[serde(default)]
    pub instances: i32,

    /// Aggregated condition messages, most severe first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<StatusMessage>,
}

/// A single aggregated status message
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub severity: Severity,
    pub message: String,
}

/// Severity of a status message
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum Severity {
    NotReady,
    RollingUpdate,
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::NotReady => write!(f, "NotReady"),
            Severity::RollingUpdate => write!(f, "RollingUpdate"),
            Severity::Warning => write!(f, "Warning"),
            Severity::Error => write!(f, "Error"),
        }
    }
}

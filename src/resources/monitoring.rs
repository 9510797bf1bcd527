//! Monitoring descriptor generation
//!
//! The ServiceMonitor kind lives in an optional third-party CRD, so the
//! object is built as a DynamicObject against an explicit ApiResource and
//! only reconciled when the cluster actually serves that kind.

use kube::api::{ApiResource, DynamicObject};
use kube::ResourceExt;
use serde_json::json;

use crate::crd::IdentityServer;
use crate::resources::naming::{monitoring_name, owner_reference, standard_labels, CLUSTER_LABEL};

/// API group serving the ServiceMonitor kind
pub const MONITORING_GROUP: &str = "monitoring.coreos.com";

/// ApiResource describing the ServiceMonitor kind
pub fn service_monitor_resource() -> ApiResource {
    ApiResource {
        group: MONITORING_GROUP.to_string(),
        version: "v1".to_string(),
        api_version: format!("{}/v1", MONITORING_GROUP),
        kind: "ServiceMonitor".to_string(),
        plural: "servicemonitors".to_string(),
    }
}

/// Generate the ServiceMonitor scraping the management endpoint
pub fn generate_service_monitor(server: &IdentityServer) -> DynamicObject {
    let server_name = server.name_any();

    let mut monitor = DynamicObject::new(&monitoring_name(server), &service_monitor_resource());
    monitor.metadata.namespace = server.namespace();
    monitor.metadata.labels = Some(standard_labels(&server_name));
    monitor.metadata.owner_references = Some(vec![owner_reference(server)]);
    monitor.data = json!({
        "spec": {
            "selector": {
                "matchLabels": {
                    CLUSTER_LABEL: server_name,
                }
            },
            "endpoints": [{
                "port": "management",
                "path": "/metrics",
                "interval": "30s",
            }]
        }
    });

    monitor
}

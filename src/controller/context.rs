use kube::Client;
use tokio::sync::OnceCell;

use crate::controller::config::OperatorConfig;
use crate::controller::dependents::DependentRegistry;
use crate::resources::monitoring::MONITORING_GROUP;

/// Shared context for the controller
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator tuning knobs
    pub config: OperatorConfig,
    /// Dependent-resource registry with its resolved evaluation order
    pub registry: DependentRegistry,
    /// Cached capability probe for the ServiceMonitor kind. A negative
    /// result stays negative until the process restarts.
    monitoring_served: OnceCell<bool>,
}

impl Context {
    pub fn new(client: Client, config: OperatorConfig, registry: DependentRegistry) -> Self {
        Self {
            client,
            config,
            registry,
            monitoring_served: OnceCell::new(),
        }
    }

    /// Whether the cluster serves the ServiceMonitor kind, probed once per
    /// process via API discovery
    pub async fn monitoring_kind_served(&self) -> bool {
        *self
            .monitoring_served
            .get_or_init(|| async {
                match kube::discovery::group(&self.client, MONITORING_GROUP).await {
                    Ok(group) => group
                        .recommended_resources()
                        .iter()
                        .any(|(ar, _)| ar.kind == "ServiceMonitor"),
                    Err(_) => false,
                }
            })
            .await
    }
}

#[cfg(test)]
impl Context {
    /// Context backed by an unconnected mock service, for tests that never
    /// touch the API server
    pub fn test() -> Self {
        let (mock_service, _handle) =
            tower_test::mock::pair::<http::Request<kube::client::Body>, http::Response<kube::client::Body>>();
        Self::new(
            Client::new(mock_service, "default"),
            OperatorConfig::default(),
            DependentRegistry::standard().unwrap(),
        )
    }
}

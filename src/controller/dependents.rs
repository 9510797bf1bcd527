//! Dependent-resource workflow engine
//!
//! Child resources are registered as descriptors in an explicit registry.
//! The registry computes a deterministic evaluation order (topological by
//! declared dependencies, registration order otherwise) once at startup,
//! then each reconciliation walks the order evaluating activation and
//! precondition gates before building and applying the desired object.
//!
//! Activation is the long-lived gate: a deactivated dependent may be garbage
//! collected if its descriptor opts in. The precondition is the per-pass
//! gate: a false precondition skips the dependent without deleting anything.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::crd::IdentityServer;
use crate::resources::monitoring::{generate_service_monitor, service_monitor_resource};
use crate::resources::naming::FIELD_MANAGER;
use crate::resources::realm_import::generate_realm_import_job;
use crate::resources::secret::generate_admin_secret;
use crate::resources::service::{generate_discovery_service, generate_service};
use crate::resources::statefulset::generate_statefulset;
use crate::resources::{ingress, network_policy, naming};

/// Values produced by earlier pipeline stages for later ones
#[derive(Default)]
pub struct ReconcileState {
    /// Hash of the update-relevant spec subset, stamped on the workload
    pub update_hash: String,
    /// Workload currently present in the cluster, if any
    pub existing_statefulset: Option<StatefulSet>,
    /// Workload as computed by the builder this pass
    pub desired_statefulset: Option<StatefulSet>,
    /// Warnings published during gate evaluation, surfaced on the status
    pub warnings: Vec<String>,
}

/// Patch strategy for a single apply attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyStrategy {
    /// Server-side declarative merge
    ServerSide,
    /// Full client-side overwrite of the object
    Overwrite,
}

/// Apply a resource, falling back once from server-side apply to a full
/// overwrite when the store rejects the merge as structurally unprocessable
pub async fn apply<K>(api: &Api<K>, resource: &K) -> Result<()>
where
    K: kube::Resource + Serialize + DeserializeOwned + Clone + std::fmt::Debug,
{
    match apply_with(api, resource, ApplyStrategy::ServerSide).await {
        Err(Error::KubeError(kube::Error::Api(ae))) if ae.code == 422 => {
            warn!(
                resource = %resource.name_any(),
                reason = %ae.reason,
                "Server-side apply rejected, retrying with full overwrite"
            );
            apply_with(api, resource, ApplyStrategy::Overwrite).await
        }
        other => other,
    }
}

/// Apply a resource with one explicit strategy
async fn apply_with<K>(api: &Api<K>, resource: &K, strategy: ApplyStrategy) -> Result<()>
where
    K: kube::Resource + Serialize + DeserializeOwned + Clone + std::fmt::Debug,
{
    let name = resource.name_any();
    match strategy {
        ApplyStrategy::ServerSide => {
            let params = PatchParams::apply(FIELD_MANAGER).force();
            api.patch(&name, &params, &Patch::Apply(resource)).await?;
        }
        ApplyStrategy::Overwrite => {
            api.patch(&name, &PatchParams::default(), &Patch::Merge(resource))
                .await?;
        }
    }
    debug!("Applied resource: {}", name);
    Ok(())
}

/// Delete a resource if it exists, tolerating a missing object
pub async fn delete_if_exists<K>(api: &Api<K>, name: &str) -> Result<()>
where
    K: kube::Resource + DeserializeOwned + Clone + std::fmt::Debug,
{
    if api.get_opt(name).await?.is_some() {
        api.delete(name, &Default::default()).await?;
        info!("Deleted deactivated resource: {}", name);
    }
    Ok(())
}

/// A managed child-resource kind
#[async_trait]
pub trait Dependent: Send + Sync {
    /// Registry name, referenced by `depends_on`
    fn name(&self) -> &'static str;

    /// Names of dependents that must be evaluated before this one
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether deactivation deletes an existing object
    fn garbage_collects(&self) -> bool {
        false
    }

    /// Per-pass gate; a false result skips the dependent without deleting it
    fn precondition(&self, _server: &IdentityServer) -> bool {
        true
    }

    /// Long-lived gate; a false result disables the dependent and makes it
    /// eligible for garbage collection. May publish warnings into the state.
    async fn activation(
        &self,
        _server: &IdentityServer,
        _ctx: &Context,
        _state: &mut ReconcileState,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Build the desired object and create-or-patch it
    async fn reconcile(
        &self,
        server: &IdentityServer,
        ctx: &Context,
        state: &mut ReconcileState,
    ) -> Result<()>;

    /// Delete the owned object on deactivation
    async fn garbage_collect(&self, _server: &IdentityServer, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

/// Ordered set of registered dependents
pub struct DependentRegistry {
    ordered: Vec<Box<dyn Dependent>>,
}

impl DependentRegistry {
    /// Build a registry, resolving the evaluation order
    ///
    /// The order is a topological sort of the dependency edges; dependents
    /// without an ordering relation keep their registration order. Unknown
    /// dependency names and cycles are registration errors.
    pub fn new(dependents: Vec<Box<dyn Dependent>>) -> Result<Self> {
        let names: Vec<&'static str> = dependents.iter().map(|d| d.name()).collect();
        for dependent in &dependents {
            for dep in dependent.depends_on() {
                if !names.contains(dep) {
                    return Err(Error::InvalidRegistration(format!(
                        "{} depends on unregistered {}",
                        dependent.name(),
                        dep
                    )));
                }
            }
        }

        let mut remaining = dependents;
        let mut ordered: Vec<Box<dyn Dependent>> = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let placed: Vec<&str> = ordered.iter().map(|d| d.name()).collect();
            let next = remaining.iter().position(|d| {
                d.depends_on().iter().all(|dep| placed.contains(dep))
            });
            match next {
                Some(index) => ordered.push(remaining.remove(index)),
                None => {
                    let stuck: Vec<&str> = remaining.iter().map(|d| d.name()).collect();
                    return Err(Error::InvalidRegistration(format!(
                        "dependency cycle among: {}",
                        stuck.join(", ")
                    )));
                }
            }
        }

        Ok(Self { ordered })
    }

    /// The production dependent set
    pub fn standard() -> Result<Self> {
        Self::new(vec![
            Box::new(AdminSecretDependent),
            Box::new(StatefulSetDependent),
            Box::new(DiscoveryServiceDependent),
            Box::new(ServiceDependent),
            Box::new(IngressDependent),
            Box::new(NetworkPolicyDependent),
            Box::new(MonitoringDependent),
            Box::new(RealmImportDependent),
        ])
    }

    /// Evaluation order, for logging and tests
    pub fn order(&self) -> Vec<&'static str> {
        self.ordered.iter().map(|d| d.name()).collect()
    }

    /// Execute one reconciliation pass over all dependents
    pub async fn run(
        &self,
        server: &IdentityServer,
        ctx: &Context,
        state: &mut ReconcileState,
    ) -> Result<()> {
        for dependent in &self.ordered {
            if !dependent.activation(server, ctx, state).await? {
                if dependent.garbage_collects() {
                    dependent.garbage_collect(server, ctx).await?;
                } else {
                    debug!("Dependent {} deactivated, skipping", dependent.name());
                }
                continue;
            }

            if !dependent.precondition(server) {
                debug!("Dependent {} precondition not met, skipping", dependent.name());
                continue;
            }

            dependent.reconcile(server, ctx, state).await?;
        }
        Ok(())
    }
}

fn namespace(server: &IdentityServer) -> String {
    server.namespace().unwrap_or_else(|| "default".to_string())
}

/// Generated bootstrap admin credentials
struct AdminSecretDependent;

#[async_trait]
impl Dependent for AdminSecretDependent {
    fn name(&self) -> &'static str {
        "admin-secret"
    }

    /// Skipped while the user references their own secret; an already
    /// generated secret is left in place in case the reference is removed
    fn precondition(&self, server: &IdentityServer) -> bool {
        server
            .spec
            .bootstrap_admin
            .as_ref()
            .and_then(|b| b.secret.as_ref())
            .is_none()
    }

    async fn reconcile(
        &self,
        server: &IdentityServer,
        ctx: &Context,
        _state: &mut ReconcileState,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace(server));
        // Generated credentials must never be overwritten on later passes
        if api.get_opt(&naming::admin_secret_name(server)).await?.is_none() {
            apply(&api, &generate_admin_secret(server)).await?;
        }
        Ok(())
    }
}

/// The server workload itself
struct StatefulSetDependent;

#[async_trait]
impl Dependent for StatefulSetDependent {
    fn name(&self) -> &'static str {
        "statefulset"
    }

    async fn reconcile(
        &self,
        server: &IdentityServer,
        ctx: &Context,
        state: &mut ReconcileState,
    ) -> Result<()> {
        let desired = generate_statefulset(server, &state.update_hash);
        let api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace(server));
        apply(&api, &desired).await?;
        state.desired_statefulset = Some(desired);
        Ok(())
    }
}

/// Headless discovery service
struct DiscoveryServiceDependent;

#[async_trait]
impl Dependent for DiscoveryServiceDependent {
    fn name(&self) -> &'static str {
        "discovery-service"
    }

    async fn reconcile(
        &self,
        server: &IdentityServer,
        ctx: &Context,
        _state: &mut ReconcileState,
    ) -> Result<()> {
        let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace(server));
        apply(&api, &generate_discovery_service(server)).await
    }
}

/// Public client-facing service
struct ServiceDependent;

#[async_trait]
impl Dependent for ServiceDependent {
    fn name(&self) -> &'static str {
        "service"
    }

    async fn reconcile(
        &self,
        server: &IdentityServer,
        ctx: &Context,
        _state: &mut ReconcileState,
    ) -> Result<()> {
        let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace(server));
        apply(&api, &generate_service(server)).await
    }
}

/// Ingress for the public service, removed when disabled
struct IngressDependent;

#[async_trait]
impl Dependent for IngressDependent {
    fn name(&self) -> &'static str {
        "ingress"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["service"]
    }

    fn garbage_collects(&self) -> bool {
        true
    }

    async fn activation(
        &self,
        server: &IdentityServer,
        _ctx: &Context,
        _state: &mut ReconcileState,
    ) -> Result<bool> {
        Ok(server.spec.ingress.as_ref().map(|i| i.enabled).unwrap_or(false))
    }

    async fn reconcile(
        &self,
        server: &IdentityServer,
        ctx: &Context,
        _state: &mut ReconcileState,
    ) -> Result<()> {
        let api: Api<Ingress> = Api::namespaced(ctx.client.clone(), &namespace(server));
        apply(&api, &ingress::generate_ingress(server)).await
    }

    async fn garbage_collect(&self, server: &IdentityServer, ctx: &Context) -> Result<()> {
        let api: Api<Ingress> = Api::namespaced(ctx.client.clone(), &namespace(server));
        delete_if_exists(&api, &naming::ingress_name(server)).await
    }
}

/// NetworkPolicy for the server pods, removed when disabled
struct NetworkPolicyDependent;

#[async_trait]
impl Dependent for NetworkPolicyDependent {
    fn name(&self) -> &'static str {
        "network-policy"
    }

    fn garbage_collects(&self) -> bool {
        true
    }

    async fn activation(
        &self,
        server: &IdentityServer,
        _ctx: &Context,
        _state: &mut ReconcileState,
    ) -> Result<bool> {
        Ok(server
            .spec
            .network_policy
            .as_ref()
            .map(|n| n.enabled)
            .unwrap_or(false))
    }

    async fn reconcile(
        &self,
        server: &IdentityServer,
        ctx: &Context,
        _state: &mut ReconcileState,
    ) -> Result<()> {
        let api: Api<NetworkPolicy> = Api::namespaced(ctx.client.clone(), &namespace(server));
        apply(&api, &network_policy::generate_network_policy(server)).await
    }

    async fn garbage_collect(&self, server: &IdentityServer, ctx: &Context) -> Result<()> {
        let api: Api<NetworkPolicy> = Api::namespaced(ctx.client.clone(), &namespace(server));
        delete_if_exists(&api, &naming::network_policy_name(server)).await
    }
}

/// Monitoring descriptor, gated on the ServiceMonitor CRD being served
struct MonitoringDependent;

impl MonitoringDependent {
    fn api(&self, server: &IdentityServer, ctx: &Context) -> Api<DynamicObject> {
        Api::namespaced_with(
            ctx.client.clone(),
            &namespace(server),
            &service_monitor_resource(),
        )
    }
}

#[async_trait]
impl Dependent for MonitoringDependent {
    fn name(&self) -> &'static str {
        "monitoring"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["service"]
    }

    fn garbage_collects(&self) -> bool {
        true
    }

    async fn activation(
        &self,
        server: &IdentityServer,
        ctx: &Context,
        state: &mut ReconcileState,
    ) -> Result<bool> {
        let enabled = server
            .spec
            .monitoring
            .as_ref()
            .map(|m| m.enabled)
            .unwrap_or(false);
        if !enabled {
            return Ok(false);
        }

        if !ctx.monitoring_kind_served().await {
            state
                .warnings
                .push("monitoring requested but the ServiceMonitor CRD is not installed".to_string());
            return Ok(false);
        }

        Ok(true)
    }

    async fn reconcile(
        &self,
        server: &IdentityServer,
        ctx: &Context,
        _state: &mut ReconcileState,
    ) -> Result<()> {
        apply(&self.api(server, ctx), &generate_service_monitor(server)).await
    }

    async fn garbage_collect(&self, server: &IdentityServer, ctx: &Context) -> Result<()> {
        delete_if_exists(&self.api(server, ctx), &naming::monitoring_name(server)).await
    }
}

/// Realm import Job, only while the primary references a realm definition
struct RealmImportDependent;

#[async_trait]
impl Dependent for RealmImportDependent {
    fn name(&self) -> &'static str {
        "realm-import"
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["statefulset"]
    }

    fn precondition(&self, server: &IdentityServer) -> bool {
        server.spec.realm_import.is_some()
    }

    async fn reconcile(
        &self,
        server: &IdentityServer,
        ctx: &Context,
        _state: &mut ReconcileState,
    ) -> Result<()> {
        let Some(job) = generate_realm_import_job(server) else {
            return Ok(());
        };
        let api: Api<k8s_openapi::api::batch::v1::Job> =
            Api::namespaced(ctx.client.clone(), &namespace(server));
        // Jobs are immutable once created; keep the finished object for audit
        if api.get_opt(&job.name_any()).await?.is_none() {
            apply(&api, &job).await?;
        }
        Ok(())
    }
}

//! Status aggregation for IdentityServer resources
//!
//! Many independent health signals are merged into one status snapshot with
//! fixed precedence: any Error makes the server not ready, any NotReady does
//! too, while RollingUpdate and Warning messages are informational only. The
//! snapshot is persisted only when it differs from the stored status, so
//! status churn never feeds back into the reconcile loop.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams, Patch, PatchParams};
use kube::ResourceExt;
use tracing::debug;

use crate::controller::context::Context;
use crate::controller::dependents::ReconcileState;
use crate::controller::error::Result;
use crate::controller::watched;
use crate::crd::{IdentityServer, IdentityServerStatus, Severity, StatusMessage};
use crate::resources::naming::{
    selector_string, statefulset_name, FIELD_MANAGER, MIGRATING_ANNOTATION,
};
use crate::resources::statefulset::pod_template_violations;

/// Hard cap on the log excerpt attached to a crashing-container message
const LOG_TAIL_CHARS: usize = 500;

/// Container waiting reasons treated as crash-like
const CRASH_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "Error",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerError",
    "OOMKilled",
];

/// Accumulates typed status messages and scalar fields
pub struct StatusAggregator {
    messages: Vec<StatusMessage>,
    observed_generation: Option<i64>,
    selector: Option<String>,
    instances: i32,
}

impl StatusAggregator {
    pub fn new(server: &IdentityServer) -> Self {
        Self {
            messages: Vec::new(),
            observed_generation: server.metadata.generation,
            selector: Some(selector_string(&server.name_any())),
            instances: 0,
        }
    }

    pub fn not_ready(&mut self, message: impl Into<String>) -> &mut Self {
        self.push(Severity::NotReady, message)
    }

    pub fn rolling_update(&mut self, message: impl Into<String>) -> &mut Self {
        self.push(Severity::RollingUpdate, message)
    }

    pub fn warning(&mut self, message: impl Into<String>) -> &mut Self {
        self.push(Severity::Warning, message)
    }

    pub fn error(&mut self, message: impl Into<String>) -> &mut Self {
        self.push(Severity::Error, message)
    }

    pub fn ready_instances(&mut self, instances: i32) -> &mut Self {
        self.instances = instances;
        self
    }

    fn push(&mut self, severity: Severity, message: impl Into<String>) -> &mut Self {
        self.messages.push(StatusMessage {
            severity,
            message: message.into(),
        });
        self
    }

    /// Produce the status snapshot
    ///
    /// Messages keep their insertion order within a severity; severities are
    /// ordered most severe first.
    pub fn build(mut self) -> IdentityServerStatus {
        let has_error = self.has(Severity::Error);
        let has_not_ready = self.has(Severity::NotReady);
        self.messages.sort_by_key(|m| severity_rank(m.severity));

        IdentityServerStatus {
            ready: !has_error && !has_not_ready,
            observed_generation: self.observed_generation,
            selector: self.selector,
            instances: self.instances,
            messages: self.messages,
        }
    }

    fn has(&self, severity: Severity) -> bool {
        self.messages.iter().any(|m| m.severity == severity)
    }
}

fn severity_rank(severity: Severity) -> u8 {
    match severity {
        Severity::Error => 0,
        Severity::NotReady => 1,
        Severity::RollingUpdate => 2,
        Severity::Warning => 3,
    }
}

/// Compute the status snapshot from the current secondary resources
///
/// `current` is the workload as last observed this pass; `extra` carries any
/// message decided upstream (for example by the update gate).
pub async fn compute(
    server: &IdentityServer,
    ctx: &Context,
    state: &ReconcileState,
    current: Option<&StatefulSet>,
    extra: Option<StatusMessage>,
) -> Result<IdentityServerStatus> {
    let mut aggregator = StatusAggregator::new(server);

    if let Some(message) = extra {
        aggregator.push(message.severity, message.message);
    }

    match current {
        None => {
            aggregator.not_ready("waiting for creation of the server workload");
        }
        Some(sts) => {
            observe_workload(server, ctx, sts, &mut aggregator).await?;
        }
    }

    for violation in pod_template_violations(server) {
        aggregator.warning(violation);
    }

    let template_source = state
        .desired_statefulset
        .as_ref()
        .or(state.existing_statefulset.as_ref());
    if let Some(sts) = template_source {
        let missing = watched::missing_references(server, sts, ctx).await?;
        if !missing.is_empty() {
            aggregator.warning(format!(
                "referenced resources are missing: {}",
                missing.join(", ")
            ));
        }
    }

    for warning in &state.warnings {
        aggregator.warning(warning.clone());
    }

    Ok(aggregator.build())
}

/// Workload-derived signals: readiness, crash diagnostics, rollout progress
async fn observe_workload(
    server: &IdentityServer,
    ctx: &Context,
    sts: &StatefulSet,
    aggregator: &mut StatusAggregator,
) -> Result<()> {
    let desired = server.spec.instances.unwrap_or(1);
    let ready = sts
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    aggregator.ready_instances(ready);

    if sts
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIGRATING_ANNOTATION))
    {
        aggregator.not_ready("performing update");
    }

    if ready < desired {
        aggregator.not_ready(format!("waiting for instances to be ready ({ready}/{desired})"));
        scan_pods(server, ctx, aggregator).await?;
    }

    let revisions = sts.status.as_ref().map(|s| {
        (
            s.current_revision.clone().unwrap_or_default(),
            s.update_revision.clone().unwrap_or_default(),
        )
    });
    if let Some((current_rev, update_rev)) = revisions {
        if !update_rev.is_empty() && current_rev != update_rev {
            aggregator.rolling_update("rolling update in progress");
        }
    }

    Ok(())
}

/// Convert crash-like container states into error messages with a bounded
/// excerpt of the previous container log
async fn scan_pods(
    server: &IdentityServer,
    ctx: &Context,
    aggregator: &mut StatusAggregator,
) -> Result<()> {
    let ns = server.namespace().unwrap_or_else(|| "default".to_string());
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
    let selector = selector_string(&server.name_any());

    let list = pods.list(&ListParams::default().labels(&selector)).await?;
    for pod in &list.items {
        let pod_name = pod.name_any();
        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref());
        let Some(statuses) = statuses else { continue };

        for container in statuses {
            if container.ready {
                continue;
            }
            let reason = container
                .state
                .as_ref()
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.as_deref());
            let Some(reason) = reason.filter(|r| CRASH_REASONS.contains(r)) else {
                continue;
            };

            let mut message = format!(
                "container {} in pod {} is failing: {}",
                container.name, pod_name, reason
            );
            if let Some(tail) = previous_log_tail(&pods, &pod_name, &container.name).await {
                message.push_str(&format!("; last log output: {}", tail));
            }
            aggregator.error(message);
        }
    }

    Ok(())
}

/// Best-effort tail of the previous container log, capped in size
async fn previous_log_tail(pods: &Api<Pod>, pod: &str, container: &str) -> Option<String> {
    let params = LogParams {
        container: Some(container.to_string()),
        previous: true,
        tail_lines: Some(10),
        ..Default::default()
    };
    match pods.logs(pod, &params).await {
        Ok(log) if !log.is_empty() => {
            let start = log.len().saturating_sub(LOG_TAIL_CHARS);
            let boundary = (start..log.len())
                .find(|i| log.is_char_boundary(*i))
                .unwrap_or(log.len());
            Some(log[boundary..].to_string())
        }
        // Log retrieval is best effort, missing output is simply omitted
        _ => None,
    }
}

/// Persist the status if it differs from the stored one
///
/// Returns whether a patch was sent.
pub async fn publish(
    server: &IdentityServer,
    ctx: &Context,
    status: &IdentityServerStatus,
) -> Result<bool> {
    if server.status.as_ref() == Some(status) {
        debug!("Status unchanged for {}, skipping update", server.name_any());
        return Ok(false);
    }

    let ns = server.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<IdentityServer> = Api::namespaced(ctx.client.clone(), &ns);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &server.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    Ok(true)
}

/// Fetch the current workload for status computation
pub async fn current_workload(
    server: &IdentityServer,
    ctx: &Context,
) -> Result<Option<StatefulSet>> {
    let ns = server.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &ns);
    Ok(api.get_opt(&statefulset_name(server)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> IdentityServer {
        IdentityServer {
            metadata: kube::core::ObjectMeta {
                name: Some("example".to_string()),
                namespace: Some("default".to_string()),
                generation: Some(3),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    #[test]
    fn test_error_overrides_rolling_update() {
        let mut aggregator = StatusAggregator::new(&server());
        aggregator.rolling_update("rolling update in progress");
        aggregator.error("container crashed");
        let status = aggregator.build();

        assert!(!status.ready);
        // Most severe first
        assert_eq!(status.messages[0].severity, Severity::Error);
    }

    #[test]
    fn test_not_ready_without_error_is_not_ready() {
        let mut aggregator = StatusAggregator::new(&server());
        aggregator.not_ready("waiting for instances");
        let status = aggregator.build();
        assert!(!status.ready);
    }

    #[test]
    fn test_warnings_do_not_affect_readiness() {
        let mut aggregator = StatusAggregator::new(&server());
        aggregator.warning("image cannot be modified");
        aggregator.rolling_update("rolling update in progress");
        let status = aggregator.build();
        assert!(status.ready);
        assert_eq!(status.messages.len(), 2);
    }

    #[test]
    fn test_scalar_fields() {
        let mut aggregator = StatusAggregator::new(&server());
        aggregator.ready_instances(2);
        let status = aggregator.build();
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(status.instances, 2);
        assert_eq!(
            status.selector.as_deref(),
            Some("app.kubernetes.io/name=example,idp.example.com/cluster=example")
        );
    }

    #[test]
    fn test_insertion_order_kept_within_severity() {
        let mut aggregator = StatusAggregator::new(&server());
        aggregator.warning("first");
        aggregator.warning("second");
        let status = aggregator.build();
        assert_eq!(status.messages[0].message, "first");
        assert_eq!(status.messages[1].message, "second");
    }

    #[test]
    fn test_identical_status_compares_equal() {
        let build = || {
            let mut aggregator = StatusAggregator::new(&server());
            aggregator.not_ready("waiting for creation of the server workload");
            aggregator.build()
        };
        assert_eq!(build(), build());
    }
}

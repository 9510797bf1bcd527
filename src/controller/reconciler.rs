//! Reconciliation driver for IdentityServer resources
//!
//! One pass sequences: defaulting, the update-compatibility gate, the
//! dependent-resource workflow, status computation, and the requeue
//! decision. Every step recomputes from current inputs; no state is carried
//! across invocations beyond what is persisted on the objects themselves.

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::dependents::ReconcileState;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::status::{self, StatusAggregator};
use crate::controller::update::{self, UpdateDecision};
use crate::controller::watched;
use crate::crd::{IdentityServer, Severity, StatusMessage};
use crate::resources::naming::FIELD_MANAGER;

/// How a reconciliation pass concluded, in terms of writes to the primary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Neither spec nor status needed a change
    NoUpdate,
    /// Spec defaults were filled in; the pass re-enters with them present
    PatchSpec,
    /// A new status snapshot was persisted
    PatchStatus,
}

/// Main reconciliation entry point
#[instrument(skip(server, ctx), fields(name = %server.name_any(), namespace = server.namespace().unwrap_or_default()))]
pub async fn reconcile(server: Arc<IdentityServer>, ctx: Arc<Context>) -> Result<Action> {
    info!("Reconciling IdentityServer");

    match reconcile_server(&server, &ctx).await {
        Ok((outcome, action)) => {
            debug!(?outcome, "Reconciliation completed");
            Ok(action)
        }
        Err(e) => {
            error!("Reconciliation failed: {}", e);
            // Surface the failure on the primary before the runtime retries
            let mut aggregator = StatusAggregator::new(&server);
            aggregator.error(format!("unexpected reconciliation error: {}", e));
            let _ = status::publish(&server, &ctx, &aggregator.build()).await;
            Err(e)
        }
    }
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(server: Arc<IdentityServer>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = server.name_any();
    let backoff = BackoffConfig::default();
    let delay = backoff.delay_for_error(error, 0);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

/// Execute one reconciliation pass and report how it concluded
pub async fn reconcile_server(
    server: &IdentityServer,
    ctx: &Context,
) -> Result<(Outcome, Action)> {
    // Owned resources carry owner references; the cluster cascade handles
    // cleanup once the primary is gone
    if server.metadata.deletion_timestamp.is_some() {
        debug!("IdentityServer is being deleted, skipping reconciliation");
        return Ok((Outcome::NoUpdate, Action::await_change()));
    }

    // Defaulting runs alone so a spec patch never races dependent creation;
    // the next pass re-enters with defaults present
    if server.spec.instances.is_none() {
        apply_spec_defaults(server, ctx).await?;
        return Ok((Outcome::PatchSpec, Action::requeue(Duration::from_secs(1))));
    }

    let mut state = ReconcileState {
        update_hash: update::update_hash(server),
        ..Default::default()
    };
    state.existing_statefulset = status::current_workload(server, ctx).await?;

    match update::evaluate(server, ctx, &state).await? {
        UpdateDecision::Probe(message) => {
            return conclude_without_workflow(
                server,
                ctx,
                &state,
                StatusMessage {
                    severity: Severity::RollingUpdate,
                    message,
                },
                Action::requeue(ctx.config.requeue_not_ready),
            )
            .await;
        }
        UpdateDecision::Blocked(reason) => {
            // Terminal for this spec hash; only a spec change re-enters
            return conclude_without_workflow(
                server,
                ctx,
                &state,
                StatusMessage {
                    severity: Severity::Error,
                    message: format!("update compatibility check failed: {}", reason),
                },
                Action::await_change(),
            )
            .await;
        }
        UpdateDecision::Proceed => {}
    }

    ctx.registry.run(server, ctx, &mut state).await?;

    let current = status::current_workload(server, ctx).await?;
    let new_status = status::compute(server, ctx, &state, current.as_ref(), None).await?;
    let patched = status::publish(server, ctx, &new_status).await?;

    let action = if !new_status.ready {
        Action::requeue(ctx.config.requeue_not_ready)
    } else if drift_watching(server, &state) {
        // External references cannot surface watch events, poll instead
        Action::requeue(ctx.config.watched_poll_interval)
    } else {
        Action::await_change()
    };

    Ok((outcome_for(patched), action))
}

/// Publish a status for a pass the update gate short-circuited
async fn conclude_without_workflow(
    server: &IdentityServer,
    ctx: &Context,
    state: &ReconcileState,
    message: StatusMessage,
    action: Action,
) -> Result<(Outcome, Action)> {
    let current = state.existing_statefulset.clone();
    let new_status = status::compute(server, ctx, state, current.as_ref(), Some(message)).await?;
    let patched = status::publish(server, ctx, &new_status).await?;
    Ok((outcome_for(patched), action))
}

fn outcome_for(patched: bool) -> Outcome {
    if patched {
        Outcome::PatchStatus
    } else {
        Outcome::NoUpdate
    }
}

/// Whether any external reference needs drift polling
fn drift_watching(server: &IdentityServer, state: &ReconcileState) -> bool {
    state
        .desired_statefulset
        .as_ref()
        .or(state.existing_statefulset.as_ref())
        .map(|sts| !watched::external_references(server, sts).is_empty())
        .unwrap_or(false)
}

/// Fill unset spec fields with their defaults through a spec patch
async fn apply_spec_defaults(server: &IdentityServer, ctx: &Context) -> Result<()> {
    let ns = server.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<IdentityServer> = Api::namespaced(ctx.client.clone(), &ns);

    let patch = serde_json::json!({
        "spec": {
            "instances": 1
        }
    });

    api.patch(
        &server.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    info!("Defaulted instances=1 for {}", server.name_any());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::controller::config::OperatorConfig;
    use crate::controller::dependents::DependentRegistry;
    use crate::crd::IdentityServerStatus;
    use crate::resources::naming::selector_string;
    use crate::resources::statefulset::generate_statefulset;
    use crate::resources::update_job::UPDATE_HASH_LABEL;

    use std::sync::{Arc, Mutex};

    use http::{Method, Request, Response};
    use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
    use k8s_openapi::api::batch::v1::{Job, JobStatus};
    use kube::client::Body;
    use kube::Client;
    use serde_json::json;

    /// A recorded API request: method, path, decoded body
    type Recorded = (Method, String, serde_json::Value);

    /// Cluster contents the fake apiserver answers from
    #[derive(Clone)]
    struct FakeCluster {
        server: IdentityServer,
        statefulset: Option<StatefulSet>,
        job: Option<Job>,
    }

    impl FakeCluster {
        fn new(server: IdentityServer) -> Self {
            Self {
                server,
                statefulset: None,
                job: None,
            }
        }

        fn with_statefulset(mut self, sts: StatefulSet) -> Self {
            self.statefulset = Some(sts);
            self
        }

        fn with_job(mut self, job: Job) -> Self {
            self.job = Some(job);
            self
        }
    }

    fn not_found() -> Response<Body> {
        let body = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": "not found",
            "reason": "NotFound",
            "code": 404
        });
        Response::builder()
            .status(404)
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn ok_json<T: serde::Serialize>(value: &T) -> Response<Body> {
        Response::builder()
            .body(Body::from(serde_json::to_vec(value).unwrap()))
            .unwrap()
    }

    /// Run a fake apiserver answering from the cluster fixture and recording
    /// every request it serves
    fn run_fake_apiserver(cluster: FakeCluster) -> (Client, Arc<Mutex<Vec<Recorded>>>) {
        let (mock_service, mut handle) =
            tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let client = Client::new(mock_service, "default");
        let recorded: Arc<Mutex<Vec<Recorded>>> = Arc::default();

        let log = recorded.clone();
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                let method = request.method().clone();
                let path = request.uri().path().to_string();
                let bytes = request.into_body().collect_bytes().await.unwrap();
                let body: serde_json::Value =
                    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
                log.lock().unwrap().push((method.clone(), path.clone(), body.clone()));

                let response = match method {
                    Method::GET if path.contains("/statefulsets/") => match &cluster.statefulset {
                        Some(sts) => ok_json(sts),
                        None => not_found(),
                    },
                    Method::GET if path.contains("/jobs/") => match &cluster.job {
                        Some(job) => ok_json(job),
                        None => not_found(),
                    },
                    Method::GET if path.contains("/pods") => {
                        ok_json(&json!({"kind": "PodList", "apiVersion": "v1", "items": []}))
                    }
                    // Everything else (secrets, ingresses, monitors, ...) is absent
                    Method::GET => not_found(),
                    Method::PATCH if path.contains("/identityservers/") => {
                        ok_json(&cluster.server)
                    }
                    // Server-side apply bodies are complete objects
                    Method::PATCH => Response::builder().body(Body::from(bytes.to_vec())).unwrap(),
                    Method::DELETE if path.contains("/jobs/") => match &cluster.job {
                        Some(job) => ok_json(job),
                        None => not_found(),
                    },
                    _ => not_found(),
                };
                send.send_response(response);
            }
        });

        (client, recorded)
    }

    fn test_context(cluster: FakeCluster) -> (Arc<Context>, Arc<Mutex<Vec<Recorded>>>) {
        let (client, recorded) = run_fake_apiserver(cluster);
        let ctx = Context::new(
            client,
            OperatorConfig::default(),
            DependentRegistry::standard().unwrap(),
        );
        (Arc::new(ctx), recorded)
    }

    fn test_server() -> IdentityServer {
        let mut server = IdentityServer {
            metadata: kube::core::ObjectMeta {
                name: Some("example".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        };
        server.spec.instances = Some(1);
        server
    }

    /// The status a fully converged single-instance server settles on
    fn converged_status() -> IdentityServerStatus {
        IdentityServerStatus {
            ready: true,
            observed_generation: Some(1),
            selector: Some(selector_string("example")),
            instances: 1,
            messages: vec![],
        }
    }

    /// A ready workload matching the declared spec
    fn ready_statefulset(server: &IdentityServer, hash: &str) -> StatefulSet {
        let mut sts = generate_statefulset(server, hash);
        sts.status = Some(StatefulSetStatus {
            ready_replicas: Some(1),
            current_revision: Some("rev-1".to_string()),
            update_revision: Some("rev-1".to_string()),
            ..Default::default()
        });
        sts
    }

    fn requests_matching(
        recorded: &Arc<Mutex<Vec<Recorded>>>,
        method: Method,
        fragment: &str,
    ) -> Vec<Recorded> {
        recorded
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, p, _)| *m == method && p.contains(fragment))
            .cloned()
            .collect()
    }

    #[tokio::test]
    async fn unset_instances_defaults_through_a_spec_patch() {
        let mut server = test_server();
        server.spec.instances = None;

        let (ctx, recorded) = test_context(FakeCluster::new(server.clone()));

        let (outcome, _action) = reconcile_server(&server, &ctx).await.unwrap();
        assert_eq!(outcome, Outcome::PatchSpec);

        let patches = requests_matching(&recorded, Method::PATCH, "/identityservers/example");
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].2["spec"]["instances"], json!(1));
        // Defaulting is its own pass: no dependent may have been touched
        assert!(requests_matching(&recorded, Method::PATCH, "/statefulsets/").is_empty());
    }

    #[tokio::test]
    async fn missing_workload_reports_waiting_and_requeues() {
        let server = test_server();
        let (ctx, recorded) = test_context(FakeCluster::new(server.clone()));

        let (outcome, action) = reconcile_server(&server, &ctx).await.unwrap();
        assert_eq!(outcome, Outcome::PatchStatus);
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));

        // The workload was applied this pass
        assert_eq!(
            requests_matching(&recorded, Method::PATCH, "/statefulsets/example").len(),
            1
        );

        let status_patches =
            requests_matching(&recorded, Method::PATCH, "/identityservers/example/status");
        assert_eq!(status_patches.len(), 1);
        let status = &status_patches[0].2["status"];
        assert_eq!(status["ready"], json!(false));
        let messages = status["messages"].as_array().unwrap();
        assert!(messages
            .iter()
            .any(|m| m["message"].as_str().unwrap().contains("waiting for creation")));
    }

    #[tokio::test]
    async fn converged_server_reconciles_to_noupdate_twice() {
        let mut server = test_server();
        server.status = Some(converged_status());
        let hash = update::update_hash(&server);
        let sts = ready_statefulset(&server, &hash);

        for _ in 0..2 {
            let (ctx, recorded) =
                test_context(FakeCluster::new(server.clone()).with_statefulset(sts.clone()));

            let (outcome, action) = reconcile_server(&server, &ctx).await.unwrap();
            assert_eq!(outcome, Outcome::NoUpdate);
            assert_eq!(action, Action::await_change());
            assert!(requests_matching(&recorded, Method::PATCH, "/status").is_empty());
        }
    }

    #[tokio::test]
    async fn running_probe_job_is_never_created_twice() {
        let server = test_server();
        let hash = update::update_hash(&server);
        // The running workload predates the current spec
        let sts = ready_statefulset(&server, "stale-hash");

        let mut job = Job::default();
        job.metadata.name = Some("example-update-check".to_string());
        job.metadata.namespace = Some("default".to_string());
        job.metadata.labels = Some(
            [(UPDATE_HASH_LABEL.to_string(), hash.clone())]
                .into_iter()
                .collect(),
        );
        job.status = Some(JobStatus {
            active: Some(1),
            ..Default::default()
        });

        for _ in 0..3 {
            let (ctx, recorded) = test_context(
                FakeCluster::new(server.clone())
                    .with_statefulset(sts.clone())
                    .with_job(job.clone()),
            );

            let (outcome, action) = reconcile_server(&server, &ctx).await.unwrap();
            assert_eq!(outcome, Outcome::PatchStatus);
            assert_eq!(action, Action::requeue(Duration::from_secs(10)));

            // The existing job satisfies the gate; no job writes happen
            assert!(requests_matching(&recorded, Method::PATCH, "/jobs/").is_empty());
            assert!(requests_matching(&recorded, Method::POST, "/jobs").is_empty());
            // The stale workload spec is not rolled forward either
            assert!(requests_matching(&recorded, Method::PATCH, "/statefulsets/").is_empty());
        }
    }

    #[tokio::test]
    async fn changed_spec_submits_exactly_one_probe_job() {
        let server = test_server();
        let sts = ready_statefulset(&server, "stale-hash");

        let (ctx, recorded) =
            test_context(FakeCluster::new(server.clone()).with_statefulset(sts));

        let (outcome, action) = reconcile_server(&server, &ctx).await.unwrap();
        assert_eq!(outcome, Outcome::PatchStatus);
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));

        let job_writes = requests_matching(&recorded, Method::PATCH, "/jobs/example-update-check");
        assert_eq!(job_writes.len(), 1);
        // Both probe containers ride in the job: actual as init, desired as main
        let pod = &job_writes[0].2["spec"]["template"]["spec"];
        assert_eq!(pod["initContainers"][0]["name"], json!("actual"));
        assert_eq!(pod["containers"][0]["name"], json!("desired"));
        assert_eq!(job_writes[0].2["spec"]["backoffLimit"], json!(0));
    }

    #[tokio::test]
    async fn failed_probe_job_blocks_the_rollout() {
        let server = test_server();
        let hash = update::update_hash(&server);
        let sts = ready_statefulset(&server, "stale-hash");

        let mut job = Job::default();
        job.metadata.name = Some("example-update-check".to_string());
        job.metadata.namespace = Some("default".to_string());
        job.metadata.labels = Some(
            [(UPDATE_HASH_LABEL.to_string(), hash.clone())]
                .into_iter()
                .collect(),
        );
        job.status = Some(JobStatus {
            failed: Some(1),
            ..Default::default()
        });

        let (ctx, recorded) = test_context(
            FakeCluster::new(server.clone())
                .with_statefulset(sts)
                .with_job(job),
        );

        let (outcome, action) = reconcile_server(&server, &ctx).await.unwrap();
        assert_eq!(outcome, Outcome::PatchStatus);
        assert_eq!(action, Action::await_change());

        // The incompatible spec never reaches the workload
        assert!(requests_matching(&recorded, Method::PATCH, "/statefulsets/").is_empty());

        let status_patches =
            requests_matching(&recorded, Method::PATCH, "/identityservers/example/status");
        assert_eq!(status_patches.len(), 1);
        let status = &status_patches[0].2["status"];
        assert_eq!(status["ready"], json!(false));
        let messages = status["messages"].as_array().unwrap();
        assert!(messages.iter().any(|m| {
            m["severity"] == json!("Error")
                && m["message"]
                    .as_str()
                    .unwrap()
                    .contains("update compatibility check failed")
        }));
    }

    #[tokio::test]
    async fn external_tls_reference_switches_to_polling() {
        let mut server = test_server();
        server.spec.http = Some(crate::crd::HttpSpec {
            http_enabled: false,
            http_port: 8080,
            https_port: 8443,
            tls_secret: Some("example-tls".to_string()),
        });
        let hash = update::update_hash(&server);
        let sts = ready_statefulset(&server, &hash);

        let (ctx, recorded) =
            test_context(FakeCluster::new(server.clone()).with_statefulset(sts));

        let (_outcome, action) = reconcile_server(&server, &ctx).await.unwrap();
        // Ready, but the by-name TLS reference needs drift polling
        assert_eq!(action, Action::requeue(Duration::from_secs(300)));

        // The missing referenced secret surfaces as a warning
        let status_patches =
            requests_matching(&recorded, Method::PATCH, "/identityservers/example/status");
        assert_eq!(status_patches.len(), 1);
        let status = &status_patches[0].2["status"];
        assert_eq!(status["ready"], json!(true));
        let messages = status["messages"].as_array().unwrap();
        assert!(messages.iter().any(|m| {
            m["severity"] == json!("Warning")
                && m["message"].as_str().unwrap().contains("Secret/example-tls")
        }));
    }
}

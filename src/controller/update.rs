//! Update-compatibility gate
//!
//! A changed workload spec must not roll onto a running cluster before a
//! probe Job has confirmed the new server can take over the existing state.
//! The gate keys the probe Job by a hash of the update-relevant spec subset,
//! so re-entering with an unchanged spec never creates a second Job, and a
//! failed probe stays terminal until the spec changes again.

use k8s_openapi::api::batch::v1::Job;
use kube::api::Api;
use kube::ResourceExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::controller::context::Context;
use crate::controller::dependents::{apply, ReconcileState};
use crate::controller::error::Result;
use crate::crd::{BootstrapAdminSpec, HttpSpec, IdentityServer, ServerOption, UpdateStrategy};
use crate::resources::naming::{update_job_name, UPDATE_HASH_ANNOTATION};
use crate::resources::statefulset::generate_statefulset;
use crate::resources::update_job::{generate_update_job, UPDATE_HASH_LABEL};

/// Outcome of the gate for one reconciliation pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateDecision {
    /// The workload spec may be applied directly
    Proceed,
    /// A probe Job is pending; re-check shortly
    Probe(String),
    /// The probe found the new spec incompatible; wait for a spec change
    Blocked(String),
}

/// The spec subset whose changes require a compatibility check
///
/// Purely operational fields (instance count, resources, scheduling, probe
/// tuning, ingress/network-policy/import/monitoring configuration) do not
/// affect the persisted server state and are excluded.
#[derive(Serialize)]
struct UpdateRelevantSpec<'a> {
    image: Option<&'a String>,
    http: Option<&'a HttpSpec>,
    additional_options: &'a [ServerOption],
    bootstrap_admin: Option<&'a BootstrapAdminSpec>,
}

/// Stable hash of the update-relevant spec subset
pub fn update_hash(server: &IdentityServer) -> String {
    let relevant = UpdateRelevantSpec {
        image: server.spec.image.as_ref(),
        http: server.spec.http.as_ref(),
        additional_options: &server.spec.additional_options,
        bootstrap_admin: server.spec.bootstrap_admin.as_ref(),
    };

    // Struct field order and Vec order make the JSON canonical
    let encoded = serde_json::to_vec(&relevant).expect("spec subset serializes");
    let digest = Sha256::digest(&encoded);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// Evaluate the gate
///
/// Expects `state.update_hash` and `state.existing_statefulset` to be
/// populated by the driver.
pub async fn evaluate(
    server: &IdentityServer,
    ctx: &Context,
    state: &ReconcileState,
) -> Result<UpdateDecision> {
    let strategy = server
        .spec
        .update
        .as_ref()
        .map(|u| u.strategy)
        .unwrap_or_default();
    if strategy == UpdateStrategy::Force {
        return Ok(UpdateDecision::Proceed);
    }

    // Nothing is running yet, nothing to be incompatible with
    let Some(existing) = state.existing_statefulset.as_ref() else {
        return Ok(UpdateDecision::Proceed);
    };

    let running_hash = existing
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(UPDATE_HASH_ANNOTATION));
    if running_hash == Some(&state.update_hash) {
        return Ok(UpdateDecision::Proceed);
    }

    let ns = server.namespace().unwrap_or_else(|| "default".to_string());
    let jobs: Api<Job> = Api::namespaced(ctx.client.clone(), &ns);
    let job_name = update_job_name(server);

    match jobs.get_opt(&job_name).await? {
        None => {
            submit_probe_job(server, existing, &jobs, ctx, state).await?;
            Ok(UpdateDecision::Probe(
                "update compatibility check started".to_string(),
            ))
        }
        Some(job) => {
            let job_hash = job.labels().get(UPDATE_HASH_LABEL).cloned();
            if job_hash.as_deref() != Some(state.update_hash.as_str()) {
                // Superseded by a newer spec; a fresh job is submitted once
                // the old one is gone
                jobs.delete(&job_name, &Default::default()).await?;
                return Ok(UpdateDecision::Probe(
                    "superseded update compatibility check is terminating".to_string(),
                ));
            }

            match probe_outcome(&job) {
                ProbeOutcome::Running => Ok(UpdateDecision::Probe(
                    "update compatibility check in progress".to_string(),
                )),
                ProbeOutcome::Succeeded => {
                    info!("Update compatibility check passed for {}", server.name_any());
                    Ok(UpdateDecision::Proceed)
                }
                ProbeOutcome::Failed(reason) => Ok(UpdateDecision::Blocked(reason)),
            }
        }
    }
}

enum ProbeOutcome {
    Running,
    Succeeded,
    Failed(String),
}

/// Read the probe verdict off the Job status
fn probe_outcome(job: &Job) -> ProbeOutcome {
    let status = job.status.as_ref();
    if status.and_then(|s| s.succeeded).unwrap_or(0) > 0 {
        return ProbeOutcome::Succeeded;
    }
    if status.and_then(|s| s.failed).unwrap_or(0) > 0 {
        let reason = status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| {
                conditions
                    .iter()
                    .find(|c| c.type_ == "Failed" && c.status == "True")
                    .and_then(|c| c.message.clone())
            })
            .unwrap_or_else(|| "compatibility check job failed".to_string());
        return ProbeOutcome::Failed(reason);
    }
    ProbeOutcome::Running
}

/// Build and submit the probe Job for the current hash
async fn submit_probe_job(
    server: &IdentityServer,
    existing: &k8s_openapi::api::apps::v1::StatefulSet,
    jobs: &Api<Job>,
    ctx: &Context,
    state: &ReconcileState,
) -> Result<()> {
    let actual = existing
        .spec
        .as_ref()
        .map(|s| s.template.clone())
        .unwrap_or_default();
    let desired = generate_statefulset(server, &state.update_hash)
        .spec
        .map(|s| s.template)
        .unwrap_or_default();

    let job = generate_update_job(
        server,
        &actual,
        &desired,
        &state.update_hash,
        ctx.config.update_job_active_deadline_secs,
        ctx.config.update_job_ttl_secs,
    );

    info!(
        "Submitting update compatibility check for {} (hash {})",
        server.name_any(),
        state.update_hash
    );
    apply(jobs, &job).await
}

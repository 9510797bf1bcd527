//! Update-compatibility probe Job generation
//!
//! Before a changed workload spec rolls out, a short-lived Job verifies that
//! the running server's persisted state is compatible with the new one. The
//! "actual" container (built from the running pod template) exports its
//! metadata into a shared work volume, then the "desired" container (built
//! from the new template) checks it. The Job's exit status is the decision
//! signal, so it is configured with no internal retries.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use kube::core::ObjectMeta;
use kube::ResourceExt;

use crate::crd::IdentityServer;
use crate::resources::naming::{
    owner_reference, standard_labels, update_job_name, UPDATE_HASH_ANNOTATION,
};

/// Label identifying the spec hash a probe Job was created for
pub const UPDATE_HASH_LABEL: &str = UPDATE_HASH_ANNOTATION;

/// Shared work volume mount path
const WORK_MOUNT_PATH: &str = "/mnt/work";

/// Where the "actual" container exports its metadata
const METADATA_FILE: &str = "/mnt/work/server-info.json";

/// Generate the probe Job for one (actual, desired) pod template pair
pub fn generate_update_job(
    server: &IdentityServer,
    actual: &PodTemplateSpec,
    desired: &PodTemplateSpec,
    update_hash: &str,
    active_deadline_seconds: i64,
    ttl_seconds_after_finished: i32,
) -> Job {
    let server_name = server.name_any();

    let mut labels = standard_labels(&server_name);
    labels.insert(UPDATE_HASH_LABEL.to_string(), update_hash.to_string());

    let actual_container = probe_container(
        actual,
        "actual",
        vec![
            "update-compatibility".to_string(),
            "metadata".to_string(),
            "--file".to_string(),
            METADATA_FILE.to_string(),
        ],
    );
    let desired_container = probe_container(
        desired,
        "desired",
        vec![
            "update-compatibility".to_string(),
            "check".to_string(),
            "--file".to_string(),
            METADATA_FILE.to_string(),
        ],
    );

    let work_volume = Volume {
        name: "work".to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(update_job_name(server)),
            namespace: server.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(server)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            // Exit status is the verdict, never retry internally
            backoff_limit: Some(0),
            active_deadline_seconds: Some(active_deadline_seconds),
            ttl_seconds_after_finished: Some(ttl_seconds_after_finished),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    // The exporting container must finish before the check runs
                    init_containers: Some(vec![actual_container]),
                    containers: vec![desired_container],
                    volumes: Some(vec![work_volume]),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Derive a probe container from a workload pod template
///
/// Health probes, lifecycle hooks and ports are stripped; only the image,
/// environment and volume mounts carry over, plus the shared work volume.
fn probe_container(template: &PodTemplateSpec, name: &str, args: Vec<String>) -> Container {
    let source = template
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .cloned()
        .unwrap_or_default();

    let mut mounts = source.volume_mounts.clone().unwrap_or_default();
    mounts.push(VolumeMount {
        name: "work".to_string(),
        mount_path: WORK_MOUNT_PATH.to_string(),
        ..Default::default()
    });

    Container {
        name: name.to_string(),
        image: source.image,
        env: source.env,
        args: Some(args),
        volume_mounts: Some(mounts),
        readiness_probe: None,
        liveness_probe: None,
        startup_probe: None,
        lifecycle: None,
        ports: None,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::statefulset::generate_statefulset;
    use kube::core::ObjectMeta as KubeObjectMeta;

    fn server() -> IdentityServer {
        IdentityServer {
            metadata: KubeObjectMeta {
                name: Some("example".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid".to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    #[test]
    fn test_probe_job_shape() {
        let s = server();
        let mut changed = s.clone();
        changed.spec.image = Some("quay.io/example/identity-server:25.0".to_string());

        let actual = generate_statefulset(&s, "old").spec.unwrap().template;
        let desired = generate_statefulset(&changed, "new").spec.unwrap().template;

        let job = generate_update_job(&s, &actual, &desired, "new", 300, 600);
        assert_eq!(job.metadata.name.as_deref(), Some("example-update-check"));
        assert_eq!(
            job.metadata.labels.as_ref().unwrap().get(UPDATE_HASH_LABEL),
            Some(&"new".to_string())
        );

        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.active_deadline_seconds, Some(300));
        assert_eq!(spec.ttl_seconds_after_finished, Some(600));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));

        let actual_c = &pod.init_containers.as_ref().unwrap()[0];
        assert_eq!(actual_c.name, "actual");
        assert!(actual_c.readiness_probe.is_none());
        assert!(actual_c
            .image
            .as_deref()
            .unwrap()
            .ends_with("identity-server:24.0"));

        let desired_c = &pod.containers[0];
        assert_eq!(desired_c.name, "desired");
        assert!(desired_c.liveness_probe.is_none());
        assert!(desired_c
            .image
            .as_deref()
            .unwrap()
            .ends_with("identity-server:25.0"));

        // Both sides share the work volume
        assert!(actual_c
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.name == "work"));
        assert!(desired_c
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .any(|m| m.name == "work"));
    }
}

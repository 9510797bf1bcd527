//! Realm import Job generation
//!
//! Runs the server image in import mode against a realm definition read from
//! a user-provided ConfigMap. The ConfigMap is referenced by name and is not
//! owned by the operator.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use kube::core::ObjectMeta;
use kube::ResourceExt;

use crate::crd::IdentityServer;
use crate::resources::naming::{owner_reference, realm_import_job_name, standard_labels};
use crate::resources::statefulset::server_image;

/// Mount path for the realm definition
const REALM_MOUNT_PATH: &str = "/mnt/realm";

/// Generate the realm import Job
///
/// Returns None when the primary declares no realm import.
pub fn generate_realm_import_job(server: &IdentityServer) -> Option<Job> {
    let import = server.spec.realm_import.as_ref()?;
    let server_name = server.name_any();

    let container = Container {
        name: "realm-import".to_string(),
        image: Some(server_image(server)),
        args: Some(vec![
            "import".to_string(),
            "--file".to_string(),
            format!("{}/{}", REALM_MOUNT_PATH, import.key),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "realm".to_string(),
            mount_path: REALM_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let volume = Volume {
        name: "realm".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: import.config_map.clone(),
            ..Default::default()
        }),
        ..Default::default()
    };

    Some(Job {
        metadata: ObjectMeta {
            name: Some(realm_import_job_name(server)),
            namespace: server.namespace(),
            labels: Some(standard_labels(&server_name)),
            owner_references: Some(vec![owner_reference(server)]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(standard_labels(&server_name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![volume]),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

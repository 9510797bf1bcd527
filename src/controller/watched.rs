//! Drift tracking for externally referenced resources
//!
//! The workload consumes some ConfigMaps and Secrets purely by name, so the
//! watch machinery never surfaces their absence. This module enumerates those
//! references from the workload pod template and reports the missing ones.
//! Read-only; never mutates.

use std::collections::BTreeSet;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::ResourceExt;

use crate::controller::context::Context;
use crate::controller::error::Result;
use crate::crd::IdentityServer;
use crate::resources::naming::admin_secret_name;

/// A by-name reference to an external resource
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reference {
    ConfigMap(String),
    Secret(String),
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reference::ConfigMap(name) => write!(f, "ConfigMap/{}", name),
            Reference::Secret(name) => write!(f, "Secret/{}", name),
        }
    }
}

/// Enumerate the named ConfigMap/Secret references a workload declares
pub fn references(sts: &StatefulSet) -> Vec<Reference> {
    let mut refs = BTreeSet::new();

    let Some(pod) = sts.spec.as_ref().map(|s| &s.template).and_then(|t| t.spec.as_ref())
    else {
        return Vec::new();
    };

    for volume in pod.volumes.iter().flatten() {
        if let Some(ref secret) = volume.secret {
            if let Some(ref name) = secret.secret_name {
                refs.insert(Reference::Secret(name.clone()));
            }
        }
        if let Some(ref config_map) = volume.config_map {
            refs.insert(Reference::ConfigMap(config_map.name.clone()));
        }
    }

    for container in pod.containers.iter().chain(pod.init_containers.iter().flatten()) {
        for env in container.env.iter().flatten() {
            let Some(ref source) = env.value_from else { continue };
            if let Some(ref secret_ref) = source.secret_key_ref {
                refs.insert(Reference::Secret(secret_ref.name.clone()));
            }
            if let Some(ref config_ref) = source.config_map_key_ref {
                refs.insert(Reference::ConfigMap(config_ref.name.clone()));
            }
        }
        for env_from in container.env_from.iter().flatten() {
            if let Some(ref secret_ref) = env_from.secret_ref {
                refs.insert(Reference::Secret(secret_ref.name.clone()));
            }
            if let Some(ref config_ref) = env_from.config_map_ref {
                refs.insert(Reference::ConfigMap(config_ref.name.clone()));
            }
        }
    }

    refs.into_iter().collect()
}

/// External references only: everything the workload or the import job
/// consumes by name, minus operator-owned objects (the generated admin
/// secret)
pub fn external_references(server: &IdentityServer, sts: &StatefulSet) -> Vec<Reference> {
    let owned_secret = admin_secret_name(server);

    let mut refs = references(sts);
    refs.retain(|r| !matches!(r, Reference::Secret(name) if *name == owned_secret));

    // The realm definition is consumed by the import job, not the workload
    if let Some(ref import) = server.spec.realm_import {
        let reference = Reference::ConfigMap(import.config_map.clone());
        if !refs.contains(&reference) {
            refs.push(reference);
        }
    }

    refs
}

/// Return the externally referenced resources that do not currently exist
pub async fn missing_references(
    server: &IdentityServer,
    sts: &StatefulSet,
    ctx: &Context,
) -> Result<Vec<String>> {
    let ns = sts.namespace().unwrap_or_else(|| "default".to_string());
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &ns);

    let mut missing = Vec::new();
    for reference in external_references(server, sts) {
        let exists = match &reference {
            Reference::Secret(name) => secrets.get_opt(name).await?.is_some(),
            Reference::ConfigMap(name) => config_maps.get_opt(name).await?.is_some(),
        };
        if !exists {
            missing.push(reference.to_string());
        }
    }

    Ok(missing)
}

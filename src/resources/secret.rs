use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::core::ObjectMeta;
use kube::ResourceExt;
use rand::Rng;

use crate::crd::IdentityServer;
use crate::resources::naming::{admin_secret_name, owner_reference, standard_labels};

/// Bootstrap admin username written into the generated secret
const ADMIN_USERNAME: &str = "admin";

/// Generate a random password
fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Generate the bootstrap admin Secret
///
/// Only created when the user did not reference an existing secret; the
/// generated credentials are never rotated by the operator.
pub fn generate_admin_secret(server: &IdentityServer) -> Secret {
    let server_name = server.name_any();

    let string_data = BTreeMap::from([
        ("username".to_string(), ADMIN_USERNAME.to_string()),
        ("password".to_string(), generate_password(32)),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(admin_secret_name(server)),
            namespace: server.namespace(),
            labels: Some(standard_labels(&server_name)),
            owner_references: Some(vec![owner_reference(server)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(string_data),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta as KubeObjectMeta;

    #[test]
    fn test_admin_secret_shape() {
        let server = IdentityServer {
            metadata: KubeObjectMeta {
                name: Some("example".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid".to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        };

        let secret = generate_admin_secret(&server);
        assert_eq!(secret.metadata.name.as_deref(), Some("example-initial-admin"));

        let data = secret.string_data.unwrap();
        assert_eq!(data.get("username"), Some(&"admin".to_string()));
        assert_eq!(data.get("password").unwrap().len(), 32);
    }
}

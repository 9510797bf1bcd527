//! Ingress generation for the public service
//!
//! Generated only while ingress is enabled on the primary; the workflow
//! engine deletes the object when the toggle is switched off.

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use kube::core::ObjectMeta;
use kube::ResourceExt;

use crate::crd::IdentityServer;
use crate::resources::naming::{ingress_name, owner_reference, service_name, standard_labels};
use crate::resources::service::public_port;

/// Generate the Ingress routing external traffic to the public service
pub fn generate_ingress(server: &IdentityServer) -> Ingress {
    let server_name = server.name_any();
    let config = server.spec.ingress.as_ref();

    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: service_name(server),
            port: Some(ServiceBackendPort {
                number: Some(public_port(server)),
                name: None,
            }),
        }),
        resource: None,
    };

    let rule = IngressRule {
        host: config.and_then(|c| c.hostname.clone()),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_string()),
                path_type: "Prefix".to_string(),
                backend,
            }],
        }),
    };

    let tls = config.and_then(|c| {
        c.tls_secret.as_ref().map(|secret| {
            vec![IngressTLS {
                hosts: c.hostname.as_ref().map(|h| vec![h.clone()]),
                secret_name: Some(secret.clone()),
            }]
        })
    });

    let annotations = config
        .map(|c| c.annotations.clone())
        .filter(|a| !a.is_empty());

    Ingress {
        metadata: ObjectMeta {
            name: Some(ingress_name(server)),
            namespace: server.namespace(),
            labels: Some(standard_labels(&server_name)),
            annotations,
            owner_references: Some(vec![owner_reference(server)]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: config.and_then(|c| c.class_name.clone()),
            rules: Some(vec![rule]),
            tls,
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta as KubeObjectMeta;

    #[test]
    fn test_ingress_routes_to_public_service() {
        let mut server = IdentityServer {
            metadata: KubeObjectMeta {
                name: Some("example".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid".to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        };
        server.spec.ingress = Some(crate::crd::IngressSpec {
            enabled: true,
            class_name: Some("nginx".to_string()),
            hostname: Some("idp.example.com".to_string()),
            annotations: Default::default(),
            tls_secret: Some("idp-tls".to_string()),
        });

        let ingress = generate_ingress(&server);
        let spec = ingress.spec.unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));

        let rule = &spec.rules.unwrap()[0];
        assert_eq!(rule.host.as_deref(), Some("idp.example.com"));
        let path = &rule.http.as_ref().unwrap().paths[0];
        let svc = path.backend.service.as_ref().unwrap();
        assert_eq!(svc.name, "example-service");
        assert_eq!(svc.port.as_ref().unwrap().number, Some(8443));

        let tls = &spec.tls.unwrap()[0];
        assert_eq!(tls.secret_name.as_deref(), Some("idp-tls"));
    }
}

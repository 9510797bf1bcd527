pub mod ingress;
pub mod monitoring;
pub mod naming;
pub mod network_policy;
pub mod realm_import;
pub mod secret;
pub mod service;
pub mod statefulset;
pub mod update_job;

mod config;
mod context;
mod dependents;
mod error;
mod reconciler;
mod status;
mod update;
mod watched;

pub use config::OperatorConfig;
pub use context::Context;
pub use dependents::{
    apply, delete_if_exists, ApplyStrategy, Dependent, DependentRegistry, ReconcileState,
};
pub use error::{BackoffConfig, Error, Result};
pub use reconciler::{error_policy, reconcile, reconcile_server, Outcome};
pub use status::StatusAggregator;
pub use update::{update_hash, UpdateDecision};
pub use watched::{external_references, missing_references, references, Reference};

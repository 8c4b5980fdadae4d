//! VSphereMachine controller
//!
//! [`reconcile`] and [`error_policy`] are the callbacks handed to the kube
//! runtime; [`run`] wires them to the watches and the completion channel.

mod machine;
mod runner;

pub use machine::{
    error_policy, reconcile, reconcile_delete, reconcile_network, reconcile_normal,
    reconcile_provider_id,
};
pub use runner::{machine_to_infrastructure, request_to_object_ref, run};

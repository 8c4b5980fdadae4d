//! Controller wiring
//!
//! Three sources feed the VSphereMachine work queue: its own watch, a watch on
//! Cluster API Machines mapped through their infrastructure reference, and the
//! completion channel provider task waiters post into.

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info};

use super::machine::{error_policy, reconcile};
use crate::context::ControllerContext;
use crate::crd::{Machine, VSphereMachine};
use crate::notify::ReconcileRequest;
use crate::{Error, Result};

/// Run the VSphereMachine controller until a shutdown signal arrives
///
/// Watches every namespace unless `namespace` is set.
pub async fn run(
    ctx: Arc<ControllerContext>,
    client: Client,
    namespace: Option<String>,
) -> Result<()> {
    let (vsphere_machines, machines) = match namespace.as_deref() {
        Some(ns) => (
            Api::<VSphereMachine>::namespaced(client.clone(), ns),
            Api::<Machine>::namespaced(client, ns),
        ),
        None => (
            Api::<VSphereMachine>::all(client.clone()),
            Api::<Machine>::all(client),
        ),
    };

    let completions = ctx.events.subscribe::<VSphereMachine>().ok_or_else(|| {
        Error::internal_with_context(
            "controller",
            "VSphereMachine completion channel already has a consumer",
        )
    })?;
    let completions = UnboundedReceiverStream::new(completions).map(request_to_object_ref);

    info!(namespace = namespace.as_deref().unwrap_or("*"), "starting VSphereMachine controller");
    Controller::new(vsphere_machines, WatcherConfig::default())
        .watches(machines, WatcherConfig::default(), machine_to_infrastructure)
        .reconcile_on(completions)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    debug!(?action, "VSphereMachine reconciliation completed");
                }
                Err(e) => {
                    error!(error = ?e, "VSphereMachine reconciliation error");
                }
            }
        })
        .await;

    info!("VSphereMachine controller stopped");
    Ok(())
}

/// Key of a completion signal as a controller object reference
pub fn request_to_object_ref(request: ReconcileRequest) -> ObjectRef<VSphereMachine> {
    let obj_ref = ObjectRef::new(&request.name);
    match request.namespace {
        Some(ns) => obj_ref.within(&ns),
        None => obj_ref,
    }
}

/// Map a Machine event to the VSphereMachine it is backed by
///
/// Machines backed by another infrastructure kind map to nothing. A reference
/// without a namespace points into the Machine's own namespace.
pub fn machine_to_infrastructure(machine: Machine) -> Option<ObjectRef<VSphereMachine>> {
    let infra = &machine.spec.infrastructure_ref;
    if infra.name.is_empty()
        || infra.kind != VSphereMachine::kind(&())
        || infra.group() != VSphereMachine::group(&())
    {
        return None;
    }

    let namespace = infra.namespace.clone().or_else(|| machine.namespace())?;
    Some(ObjectRef::new(&infra.name).within(&namespace))
}

//! VSphereMachine controller implementation
//!
//! One reconcile resolves the machine's ancestors, opens (or reuses) a
//! provider session, lets the VM service take a single step and writes the
//! resulting status back. The write-back runs whatever the outcome of the
//! step, so a task reference recorded just before an error is never lost.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::context::{ControllerContext, MachineContext};
use crate::crd::{MachineAddress, VSphereMachine, VirtualMachine, VirtualMachineState};
use crate::machines::{get_cluster_from_metadata, get_owner_machine, get_vsphere_cluster};
use crate::patch::{status_diff, PatchHelper, PatchOutcome};
use crate::provider_id::encode_provider_id;
use crate::retry::{retry_with_interval, RetryConfig};
use crate::services::{vm_service_for, VirtualMachineService};
use crate::session::Endpoint;
use crate::{Error, Result};

/// Reconcile a VSphereMachine
///
/// Returns a requeue after the sync period on success, including every
/// "waiting for something" outcome. Errors go through [`error_policy`].
#[instrument(skip(vsphere_machine, ctx), fields(machine = %vsphere_machine.key()))]
pub async fn reconcile(
    vsphere_machine: Arc<VSphereMachine>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let namespace = vsphere_machine.namespace().unwrap_or_default();
    let name = vsphere_machine.name_any();
    let resync = Action::requeue(ctx.settings.sync_period);

    // The trigger may be a synthetic event or a lagging cache entry
    let Some(vsphere_machine) = ctx.store.get_vsphere_machine(&namespace, &name).await? else {
        info!("VSphereMachine not found, won't reconcile");
        return Ok(Action::await_change());
    };
    if vsphere_machine.has_debug_annotation() {
        dump("local VSphereMachine on entry", &vsphere_machine);
    }

    let store = ctx.store.as_ref();
    let Some(machine) = get_owner_machine(store, &vsphere_machine).await? else {
        info!("waiting for Machine controller to set OwnerRef on VSphereMachine");
        return Ok(resync);
    };
    let Some(cluster) = get_cluster_from_metadata(store, &machine).await? else {
        info!("Machine is missing cluster label or cluster does not exist");
        return Ok(resync);
    };
    let Some(vsphere_cluster) = get_vsphere_cluster(store, &cluster).await? else {
        info!("waiting for VSphereCluster");
        return Ok(resync);
    };

    let key = vsphere_machine.key();
    let datacenter = if vsphere_machine.spec.datacenter.is_empty() {
        vsphere_cluster.spec.datacenter.clone().unwrap_or_default()
    } else {
        vsphere_machine.spec.datacenter.clone()
    };
    let endpoint = Endpoint::new(vsphere_cluster.spec.server.clone(), datacenter);
    let session = ctx
        .sessions
        .get_or_create(&endpoint, &ctx.credentials)
        .await
        .map_err(|e| e.during(key.as_str(), "create-session"))?;

    let vm_service = match &ctx.vm_service {
        Some(service) => service.clone(),
        None => {
            let about = session
                .about()
                .await
                .map_err(|e| e.during(key.as_str(), "about"))?;
            vm_service_for(&about)?
        }
    };

    let patch_helper = PatchHelper::new(&vsphere_machine)?;
    let mut mctx = MachineContext {
        cluster,
        vsphere_cluster,
        machine,
        vsphere_machine,
        session,
        patch_helper,
        events: ctx.events.clone(),
    };

    debug!(task_ref = mctx.vsphere_machine.task_ref().unwrap_or_default(), "task ref on entry");
    let result = if mctx.vsphere_machine.is_deleting() {
        reconcile_delete(&mut mctx, vm_service.as_ref()).await
    } else {
        reconcile_normal(&mut mctx, vm_service.as_ref()).await
    };
    debug!(task_ref = mctx.vsphere_machine.task_ref().unwrap_or_default(), "task ref on exit");
    if mctx.vsphere_machine.has_debug_annotation() {
        dump("local VSphereMachine on exit", &mctx.vsphere_machine);
    }

    // The step's own error wins over a failed write-back, which is logged
    let patched = patch_machine(&ctx, &mctx).await;
    result?;
    patched?;
    Ok(resync)
}

/// Bring a live machine one step closer to ready
pub async fn reconcile_normal(
    ctx: &mut MachineContext,
    vm_service: &dyn VirtualMachineService,
) -> Result<()> {
    if ctx.vsphere_machine.has_terminal_error() {
        info!("error state detected, skipping reconciliation");
        return Ok(());
    }

    ctx.vsphere_machine.add_finalizer();

    if !ctx.cluster.infrastructure_ready() {
        info!("cluster infrastructure is not ready yet");
        return Ok(());
    }
    if !ctx.machine.has_bootstrap_data() {
        info!("waiting for bootstrap data to be available");
        return Ok(());
    }

    let vm = vm_service.reconcile_vm(ctx).await?;
    if vm.state != VirtualMachineState::Ready {
        info!(
            expected_vm_state = %VirtualMachineState::Ready,
            actual_vm_state = %vm.state,
            "vm state is not reconciled"
        );
        return Ok(());
    }

    if !reconcile_network(&mut ctx.vsphere_machine, &vm)? {
        info!("waiting on vm networking");
        return Ok(());
    }

    reconcile_provider_id(&mut ctx.vsphere_machine, &vm)?;

    ctx.vsphere_machine.status_mut().ready = true;
    info!("VSphereMachine is infrastructure-ready");
    Ok(())
}

/// Bring a deleted machine one step closer to its VM being gone
///
/// The finalizer is released only once the provider confirms the VM no
/// longer exists.
pub async fn reconcile_delete(
    ctx: &mut MachineContext,
    vm_service: &dyn VirtualMachineService,
) -> Result<()> {
    info!("handling deleted VSphereMachine");

    let vm = vm_service.destroy_vm(ctx).await?;
    if vm.state != VirtualMachineState::NotFound {
        info!(
            expected_vm_state = %VirtualMachineState::NotFound,
            actual_vm_state = %vm.state,
            "vm state is not reconciled"
        );
        return Ok(());
    }

    ctx.vsphere_machine.remove_finalizer();
    info!("vm is gone, finalizer removed");
    Ok(())
}

/// Project the VM's NICs and addresses into status
///
/// Returns `false` while no address has been reported. A NIC count that
/// differs from the configured devices is a configuration error.
pub fn reconcile_network(machine: &mut VSphereMachine, vm: &VirtualMachine) -> Result<bool> {
    let expected = machine.spec.network.devices.len();
    let actual = vm.network.len();
    if expected != actual {
        return Err(Error::config_for(
            machine.key(),
            format!("invalid network count: exp={expected} act={actual}"),
        ));
    }

    let status = machine.status_mut();
    status.network = vm.network.clone();

    let addresses: Vec<MachineAddress> = status
        .network
        .iter()
        .flat_map(|nic| nic.ip_addrs.iter().map(MachineAddress::internal_ip))
        .collect();
    if addresses.is_empty() {
        info!("waiting on IP addresses");
        return Ok(false);
    }

    status.addresses = addresses;
    Ok(true)
}

/// Derive the provider ID from the VM's BIOS UUID and record it in status
pub fn reconcile_provider_id(machine: &mut VSphereMachine, vm: &VirtualMachine) -> Result<()> {
    let provider_id = encode_provider_id(&vm.bios_uuid);
    if provider_id.is_empty() {
        return Err(Error::config_for(
            machine.key(),
            format!("invalid BIOS UUID {:?}", vm.bios_uuid),
        ));
    }

    let status = machine.status_mut();
    if status.provider_id.as_deref() != Some(provider_id.as_str()) {
        info!(provider_id = %provider_id, "updated provider ID");
        status.provider_id = Some(provider_id);
    }
    Ok(())
}

/// Error policy for the controller
///
/// Retryable errors come back quickly; errors that need someone to fix the
/// spec or the environment wait longer.
pub fn error_policy(
    vsphere_machine: Arc<VSphereMachine>,
    error: &Error,
    ctx: Arc<ControllerContext>,
) -> Action {
    error!(
        %error,
        machine = %vsphere_machine.key(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.settings.retry_requeue)
    } else {
        Action::requeue(ctx.settings.config_requeue)
    }
}

async fn patch_machine(ctx: &ControllerContext, mctx: &MachineContext) -> Result<()> {
    let outcome = mctx
        .patch_helper
        .patch(ctx.store.as_ref(), &mctx.vsphere_machine)
        .await
        .inspect_err(|e| error!(error = %e, machine = %mctx, "patch failed"))?;

    match outcome {
        PatchOutcome::Unchanged => debug!("nothing to patch"),
        PatchOutcome::Gone => info!("VSphereMachine is gone, nothing left to patch"),
        PatchOutcome::Patched(_) if ctx.settings.verify_patch => verify_patch(ctx, mctx).await,
        PatchOutcome::Patched(_) => {}
    }
    Ok(())
}

/// Poll the store until it serves a version newer than the snapshot
///
/// Purely observational: a patch that never shows up is logged, not failed.
async fn verify_patch(ctx: &ControllerContext, mctx: &MachineContext) {
    let local = &mctx.vsphere_machine;
    let namespace = local.namespace().unwrap_or_default();
    let name = local.name_any();
    let (store, ns, name) = (ctx.store.as_ref(), namespace.as_str(), name.as_str());
    let local_version = mctx.patch_helper.resource_version();
    let debug_dumps = local.has_debug_annotation();

    let config = RetryConfig::fixed_interval(
        ctx.settings.verify_attempts,
        ctx.settings.verify_interval,
    );
    let result: Result<Option<VSphereMachine>> =
        retry_with_interval(&config, "verify_patch", move || async move {
            let remote = match store.get_vsphere_machine(ns, name).await {
                Ok(Some(remote)) => remote,
                Ok(None) => return Ok(None),
                Err(e) => return Err(e),
            };
            let remote_version = remote.resource_version().unwrap_or_default();
            if remote_version != local_version {
                return Ok(Some(remote));
            }

            info!(
                local_resource_version = %local_version,
                remote_resource_version = %remote_version,
                "resource is not patched"
            );
            if debug_dumps {
                match status_diff(local, &remote) {
                    Ok(changed) => info!(?changed, "status drift between local and remote"),
                    Err(e) => warn!(error = %e, "failed to diff status"),
                }
                dump("remote VSphereMachine drift", &remote);
            }
            Err(Error::internal_with_context(
                "verify_patch",
                format!("stored resource version is still {remote_version}"),
            ))
        })
        .await;

    match result {
        Ok(Some(remote)) => {
            info!(
                local_resource_version = %local_version,
                remote_resource_version = %remote.resource_version().unwrap_or_default(),
                "resource is patched"
            );
            if debug_dumps {
                dump("remote VSphereMachine on exit", &remote);
            }
        }
        Ok(None) => debug!("VSphereMachine removed after patch"),
        Err(e) => warn!(error = %e, "patched VSphereMachine not yet visible"),
    }
}

fn dump<T: Serialize>(label: &str, obj: &T) {
    match serde_json::to_string(obj) {
        Ok(json) => info!(label, object = %json, "resource dump"),
        Err(e) => warn!(label, error = %e, "failed to serialize resource dump"),
    }
}

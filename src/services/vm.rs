//! Task-based VM service
//!
//! Every provider operation here is asynchronous on the provider side. A call
//! starts at most one task, records it in `status.taskRef` and returns a
//! pending view; the next reconcile observes the task before doing anything
//! else. Whenever a task is recorded on the way out, a completion waiter is
//! registered so that reconcile happens as soon as the task ends.

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, error, info};

use super::VirtualMachineService;
use crate::context::MachineContext;
use crate::crd::{NetworkStatus, VirtualMachine, VirtualMachineState};
use crate::machines::sanitize_ip_addrs;
use crate::notify::{notify_on_completion, wait_for_power_on_then_network, wait_for_task};
use crate::provider::{CloneSpec, NicInfo, PowerState, TaskRef, VmRef};
use crate::provider_id::decode_provider_id;
use crate::task::{record_task, reconcile_in_flight_task};
use crate::{Error, Result};

/// VM service for endpoints that expose asynchronous tasks
#[derive(Clone, Copy, Debug, Default)]
pub struct TaskVmService;

#[async_trait]
impl VirtualMachineService for TaskVmService {
    async fn reconcile_vm(&self, ctx: &mut MachineContext) -> Result<VirtualMachine> {
        let result = reconcile_vm_step(ctx).await;
        reconcile_on_task_completion(ctx);
        result
    }

    async fn destroy_vm(&self, ctx: &mut MachineContext) -> Result<VirtualMachine> {
        let result = destroy_vm_step(ctx).await;
        reconcile_on_task_completion(ctx);
        result
    }
}

async fn reconcile_vm_step(ctx: &mut MachineContext) -> Result<VirtualMachine> {
    let name = ctx.vsphere_machine.name_any();
    if reconcile_in_flight_task(ctx.session.as_ref(), &mut ctx.vsphere_machine).await? {
        return Ok(VirtualMachine::pending(name));
    }

    let Some(vm_ref) = find_vm(ctx).await? else {
        info!(machine = %ctx.key(), "vm not found, cloning from template");
        let spec = clone_spec(ctx)?;
        let task = ctx
            .session
            .clone_vm(&spec)
            .await
            .map_err(|e| e.during(ctx.key(), "clone"))?;
        record_task(&mut ctx.vsphere_machine, &task);
        return Ok(VirtualMachine::pending(name));
    };

    let props = ctx
        .session
        .vm_properties(&vm_ref)
        .await
        .map_err(|e| e.during(ctx.key(), "properties"))?;
    let mut vm = VirtualMachine {
        name: props.name,
        bios_uuid: props.bios_uuid,
        state: VirtualMachineState::Ready,
        network: network_status(&props.nics),
    };

    if props.power_state != PowerState::PoweredOn {
        info!(machine = %ctx.key(), vm = %vm_ref, power_state = %props.power_state, "powering on vm");
        let task = ctx
            .session
            .power_on(&vm_ref)
            .await
            .map_err(|e| e.during(ctx.key(), "power-on"))?;
        record_task(&mut ctx.vsphere_machine, &task);
        notify_on_completion(
            &ctx.events,
            &ctx.vsphere_machine,
            wait_for_power_on_then_network(ctx.session.clone(), task, vm_ref),
        )?;
        vm.state = VirtualMachineState::Pending;
    }

    Ok(vm)
}

async fn destroy_vm_step(ctx: &mut MachineContext) -> Result<VirtualMachine> {
    let name = ctx.vsphere_machine.name_any();
    if reconcile_in_flight_task(ctx.session.as_ref(), &mut ctx.vsphere_machine).await? {
        return Ok(VirtualMachine::pending(name));
    }

    let Some(vm_ref) = find_vm(ctx).await? else {
        info!(machine = %ctx.key(), "vm is gone");
        return Ok(VirtualMachine::not_found(name));
    };

    let props = ctx
        .session
        .vm_properties(&vm_ref)
        .await
        .map_err(|e| e.during(ctx.key(), "properties"))?;

    let task = if props.power_state == PowerState::PoweredOn {
        info!(machine = %ctx.key(), vm = %vm_ref, "powering off vm before destroying it");
        ctx.session
            .power_off(&vm_ref)
            .await
            .map_err(|e| e.during(ctx.key(), "power-off"))?
    } else {
        info!(machine = %ctx.key(), vm = %vm_ref, "destroying vm");
        ctx.session
            .destroy(&vm_ref)
            .await
            .map_err(|e| e.during(ctx.key(), "destroy"))?
    };
    record_task(&mut ctx.vsphere_machine, &task);
    Ok(VirtualMachine::pending(name))
}

/// Locate the VM behind a machine
///
/// A known provider ID is looked up by BIOS UUID first. When that misses, or
/// no provider ID is known yet, the owning Machine's UID is matched against
/// the instance UUID assigned at clone time.
async fn find_vm(ctx: &MachineContext) -> Result<Option<VmRef>> {
    let datacenter = ctx.datacenter();

    if let Some(provider_id) = ctx.vsphere_machine.known_provider_id() {
        let uuid = decode_provider_id(provider_id);
        if uuid.is_empty() {
            return Err(Error::config_for(
                ctx.key(),
                format!("invalid providerID {provider_id}"),
            ));
        }
        let found = ctx
            .session
            .find_by_bios_uuid(datacenter, &uuid)
            .await
            .map_err(|e| e.during(ctx.key(), "find-by-bios-uuid"))?;
        if found.is_some() {
            return Ok(found);
        }
        debug!(machine = %ctx.key(), bios_uuid = %uuid, "no vm with bios uuid, trying instance uuid");
    }

    let uuid = instance_uuid(ctx)?;
    ctx.session
        .find_by_instance_uuid(datacenter, uuid)
        .await
        .map_err(|e| e.during(ctx.key(), "find-by-instance-uuid"))
}

fn instance_uuid(ctx: &MachineContext) -> Result<&str> {
    ctx.machine.instance_uuid().ok_or_else(|| {
        Error::validation_for(
            ctx.key(),
            format!("owner Machine {} has no UID", ctx.machine.name_any()),
        )
    })
}

fn clone_spec(ctx: &MachineContext) -> Result<CloneSpec> {
    let spec = &ctx.vsphere_machine.spec;
    Ok(CloneSpec {
        name: ctx.vsphere_machine.name_any(),
        datacenter: ctx.datacenter().to_string(),
        template: spec.template.clone(),
        instance_uuid: instance_uuid(ctx)?.to_string(),
        num_cpus: spec.num_cpus,
        memory_mib: spec.memory_mib,
        disk_gib: spec.disk_gib,
        devices: spec.network.devices.clone(),
        user_data: ctx.machine.spec.bootstrap.data.clone().unwrap_or_default(),
    })
}

fn network_status(nics: &[NicInfo]) -> Vec<NetworkStatus> {
    nics.iter()
        .map(|nic| NetworkStatus {
            connected: nic.connected,
            ip_addrs: sanitize_ip_addrs(&nic.ip_addrs),
            mac_addr: nic.mac_addr.clone(),
            network_name: Some(nic.network_name.clone()).filter(|n| !n.is_empty()),
        })
        .collect()
}

/// Ask for another reconcile once the recorded task, if any, ends
fn reconcile_on_task_completion(ctx: &MachineContext) {
    let Some(task_ref) = ctx.vsphere_machine.task_ref() else {
        debug!(machine = %ctx.key(), reason = "no-task", "skipping reconcile on task completion");
        return;
    };
    let task = TaskRef::new(task_ref);
    info!(machine = %ctx.key(), task_ref = %task, "enqueuing reconcile request on task completion");
    let wait = wait_for_task(ctx.session.clone(), task);
    if let Err(e) = notify_on_completion(&ctx.events, &ctx.vsphere_machine, wait) {
        error!(machine = %ctx.key(), error = %e, "failed to enqueue reconcile request for task completion");
    }
}

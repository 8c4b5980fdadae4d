//! In-memory vCenter simulator
//!
//! Backs the unit tests and the `--simulator` run mode. VMs and tasks live in
//! concurrent maps; tasks progress deterministically each time they are
//! observed (queued, then running, then success) and apply their effect
//! exactly once when they finish.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use super::{
    CloneSpec, NicInfo, PowerState, ProviderAbout, ProviderClient, ProviderConnector, TaskInfo,
    TaskRef, TaskState, VmProperties, VmRef,
};
use crate::session::{Credentials, Endpoint};
use crate::{Error, Result};

/// API version reported by default
const DEFAULT_API_VERSION: &str = "6.7.3";

/// How many observations a task takes from queued to finished
const DEFAULT_TASK_STEPS: u32 = 2;

#[derive(Clone, Debug)]
enum TaskEffect {
    Clone(Box<CloneSpec>),
    PowerOn(String),
    PowerOff(String),
    Destroy(String),
}

impl TaskEffect {
    fn name(&self) -> &'static str {
        match self {
            Self::Clone(_) => "CloneVM_Task",
            Self::PowerOn(_) => "PowerOnVM_Task",
            Self::PowerOff(_) => "PowerOffVM_Task",
            Self::Destroy(_) => "Destroy_Task",
        }
    }

    fn description_id(&self) -> &'static str {
        match self {
            Self::Clone(_) => "VirtualMachine.clone",
            Self::PowerOn(_) => "VirtualMachine.powerOn",
            Self::PowerOff(_) => "VirtualMachine.powerOff",
            Self::Destroy(_) => "VirtualMachine.destroy",
        }
    }
}

#[derive(Clone, Debug)]
struct SimTask {
    effect: TaskEffect,
    entity_name: String,
    observations: u32,
    /// State as vCenter reports it on the wire
    wire_state: &'static str,
    error: Option<String>,
}

#[derive(Clone, Debug)]
struct SimVm {
    name: String,
    datacenter: String,
    bios_uuid: String,
    instance_uuid: String,
    power_state: PowerState,
    devices: Vec<crate::crd::NetworkDeviceSpec>,
    nics: Vec<NicInfo>,
}

#[derive(Default)]
struct SimState {
    vms: DashMap<String, SimVm>,
    tasks: DashMap<String, SimTask>,
    templates: DashMap<String, ()>,
    next_id: AtomicU64,
    logged_out: AtomicBool,
}

/// An in-memory provider that behaves like a small vCenter
///
/// Clones share state, so a test can keep a handle to inspect what the
/// controller did through the session it was given.
#[derive(Clone)]
pub struct Simulator {
    state: Arc<SimState>,
    api_version: String,
    task_steps: u32,
    strict_templates: bool,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    /// Create an empty simulator that accepts any template name
    pub fn new() -> Self {
        Self {
            state: Arc::new(SimState::default()),
            api_version: DEFAULT_API_VERSION.to_string(),
            task_steps: DEFAULT_TASK_STEPS,
            strict_templates: false,
        }
    }

    /// Report a different API version from `about`
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Number of observations before a task finishes (0 finishes at once)
    pub fn with_task_steps(mut self, steps: u32) -> Self {
        self.task_steps = steps;
        self
    }

    /// Only allow clones from registered templates; others fail their task
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.strict_templates = true;
        self.state.templates.insert(template.into(), ());
        self
    }

    /// Number of VMs that currently exist
    pub fn vm_count(&self) -> usize {
        self.state.vms.len()
    }

    /// Number of tasks started so far
    pub fn task_count(&self) -> usize {
        self.state.tasks.len()
    }

    /// Number of clone tasks started so far
    pub fn clone_count(&self) -> usize {
        self.state
            .tasks
            .iter()
            .filter(|t| matches!(t.effect, TaskEffect::Clone(_)))
            .count()
    }

    /// Forget a task, as vCenter does once its history is trimmed
    pub fn expire_task(&self, task: &TaskRef) {
        self.state.tasks.remove(task.as_str());
    }

    /// Remove a VM behind the controller's back
    pub fn remove_vm_out_of_band(&self, bios_uuid: &str) {
        self.state.vms.retain(|_, vm| vm.bios_uuid != bios_uuid);
    }

    /// Drop all NICs but the first from a VM
    pub fn detach_extra_nics(&self, bios_uuid: &str) {
        for mut vm in self.state.vms.iter_mut() {
            if vm.bios_uuid == bios_uuid {
                vm.nics.truncate(1);
            }
        }
    }

    /// BIOS UUIDs of all VMs
    pub fn bios_uuids(&self) -> Vec<String> {
        self.state.vms.iter().map(|vm| vm.bios_uuid.clone()).collect()
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}-{n}")
    }

    fn start_task(&self, effect: TaskEffect, entity_name: String) -> TaskRef {
        let id = self.next_id("task");
        debug!(task_ref = %id, task = effect.name(), entity = %entity_name, "simulator task queued");
        self.state.tasks.insert(
            id.clone(),
            SimTask {
                effect,
                entity_name,
                observations: 0,
                wire_state: "queued",
                error: None,
            },
        );
        let task = TaskRef::new(id);
        if self.task_steps == 0 {
            self.advance(&task, true);
        }
        task
    }

    fn vm_name(&self, vm: &VmRef) -> Result<String> {
        self.state
            .vms
            .get(vm.as_str())
            .map(|v| v.name.clone())
            .ok_or_else(|| Error::provider("lookup", format!("vm {vm} not found")))
    }

    /// Observe a task, moving it one step forward (or straight to the end when
    /// `finish` is set). Returns `None` for unknown tasks.
    fn advance(&self, task: &TaskRef, finish: bool) -> Option<TaskInfo> {
        let mut entry = self.state.tasks.get_mut(task.as_str())?;
        if !TaskState::from_wire(entry.wire_state).is_terminal() {
            entry.observations += 1;
            if finish || entry.observations > self.task_steps {
                let outcome = self.apply(&entry.effect);
                match outcome {
                    Ok(()) => entry.wire_state = "success",
                    Err(msg) => {
                        entry.wire_state = "error";
                        entry.error = Some(msg);
                    }
                }
            } else if entry.observations > 1 {
                entry.wire_state = "running";
            }
        }
        Some(TaskInfo {
            task_ref: task.clone(),
            state: TaskState::from_wire(entry.wire_state),
            name: entry.effect.name().to_string(),
            entity_name: entry.entity_name.clone(),
            description_id: entry.effect.description_id().to_string(),
            error: entry.error.clone(),
        })
    }

    fn apply(&self, effect: &TaskEffect) -> std::result::Result<(), String> {
        match effect {
            TaskEffect::Clone(spec) => {
                if self.strict_templates && !self.state.templates.contains_key(&spec.template) {
                    return Err(format!("template {} not found", spec.template));
                }
                let id = self.next_id("vm");
                let nics = spec
                    .devices
                    .iter()
                    .enumerate()
                    .map(|(i, d)| NicInfo {
                        network_name: d.network_name.clone(),
                        mac_addr: d
                            .mac_addr
                            .clone()
                            .unwrap_or_else(|| format!("00:50:56:00:00:{:02x}", i + 1)),
                        connected: false,
                        ip_addrs: Vec::new(),
                    })
                    .collect();
                self.state.vms.insert(
                    id,
                    SimVm {
                        name: spec.name.clone(),
                        datacenter: spec.datacenter.clone(),
                        bios_uuid: Uuid::new_v4().to_string(),
                        instance_uuid: spec.instance_uuid.clone(),
                        power_state: PowerState::PoweredOff,
                        devices: spec.devices.clone(),
                        nics,
                    },
                );
                Ok(())
            }
            TaskEffect::PowerOn(id) => {
                let mut vm = self
                    .state
                    .vms
                    .get_mut(id)
                    .ok_or_else(|| format!("vm {id} not found"))?;
                vm.power_state = PowerState::PoweredOn;
                let host = self.state.next_id.fetch_add(1, Ordering::SeqCst) % 250 + 2;
                let devices = vm.devices.clone();
                for (nic, device) in vm.nics.iter_mut().zip(devices.iter()) {
                    nic.connected = true;
                    nic.ip_addrs = if device.ip_addrs.is_empty() {
                        // guest tools report link-local v6 alongside the lease
                        vec![format!("10.0.0.{host}"), "fe80::250:56ff:fe00:1".to_string()]
                    } else {
                        device
                            .ip_addrs
                            .iter()
                            .map(|a| a.split('/').next().unwrap_or(a).to_string())
                            .collect()
                    };
                }
                Ok(())
            }
            TaskEffect::PowerOff(id) => {
                let mut vm = self
                    .state
                    .vms
                    .get_mut(id)
                    .ok_or_else(|| format!("vm {id} not found"))?;
                vm.power_state = PowerState::PoweredOff;
                for nic in vm.nics.iter_mut() {
                    nic.connected = false;
                    nic.ip_addrs.clear();
                }
                Ok(())
            }
            TaskEffect::Destroy(id) => {
                let Some((_, vm)) = self.state.vms.remove(id) else {
                    return Err(format!("vm {id} not found"));
                };
                if vm.power_state == PowerState::PoweredOn {
                    // vCenter refuses to destroy a running VM
                    self.state.vms.insert(id.clone(), vm);
                    return Err("the attempted operation cannot be performed in the current state (Powered on)".to_string());
                }
                Ok(())
            }
        }
    }

    fn find(&self, predicate: impl Fn(&SimVm) -> bool) -> Option<VmRef> {
        self.state
            .vms
            .iter()
            .find(|e| predicate(e.value()))
            .map(|e| VmRef::new(e.key().clone()))
    }
}

#[async_trait]
impl ProviderClient for Simulator {
    async fn about(&self) -> Result<ProviderAbout> {
        Ok(ProviderAbout {
            product: "VMware vCenter Server (simulated)".to_string(),
            api_version: self.api_version.clone(),
        })
    }

    async fn is_active(&self) -> Result<bool> {
        Ok(!self.state.logged_out.load(Ordering::SeqCst))
    }

    async fn find_by_bios_uuid(&self, datacenter: &str, uuid: &str) -> Result<Option<VmRef>> {
        Ok(self.find(|vm| vm.datacenter == datacenter && vm.bios_uuid.eq_ignore_ascii_case(uuid)))
    }

    async fn find_by_instance_uuid(&self, datacenter: &str, uuid: &str) -> Result<Option<VmRef>> {
        Ok(self.find(|vm| vm.datacenter == datacenter && vm.instance_uuid == uuid))
    }

    async fn clone_vm(&self, spec: &CloneSpec) -> Result<TaskRef> {
        if spec.template.is_empty() {
            return Err(Error::provider("clone", "template name is empty"));
        }
        Ok(self.start_task(TaskEffect::Clone(Box::new(spec.clone())), spec.name.clone()))
    }

    async fn power_on(&self, vm: &VmRef) -> Result<TaskRef> {
        let name = self.vm_name(vm)?;
        Ok(self.start_task(TaskEffect::PowerOn(vm.as_str().to_string()), name))
    }

    async fn power_off(&self, vm: &VmRef) -> Result<TaskRef> {
        let name = self.vm_name(vm)?;
        Ok(self.start_task(TaskEffect::PowerOff(vm.as_str().to_string()), name))
    }

    async fn destroy(&self, vm: &VmRef) -> Result<TaskRef> {
        let name = self.vm_name(vm)?;
        Ok(self.start_task(TaskEffect::Destroy(vm.as_str().to_string()), name))
    }

    async fn get_task(&self, task: &TaskRef) -> Result<Option<TaskInfo>> {
        Ok(self.advance(task, false))
    }

    async fn wait_for_task(&self, task: &TaskRef) -> Result<TaskInfo> {
        self.advance(task, true)
            .ok_or_else(|| Error::provider("wait-for-task", format!("task {task} not found")))
    }

    async fn vm_properties(&self, vm: &VmRef) -> Result<VmProperties> {
        let v = self
            .state
            .vms
            .get(vm.as_str())
            .ok_or_else(|| Error::provider("properties", format!("vm {vm} not found")))?;
        Ok(VmProperties {
            name: v.name.clone(),
            bios_uuid: v.bios_uuid.clone(),
            instance_uuid: v.instance_uuid.clone(),
            power_state: v.power_state,
            nics: v.nics.clone(),
        })
    }

    async fn wait_for_net_ip(&self, vm: &VmRef) -> Result<()> {
        // Addresses appear with power-on; poll briefly for callers racing it
        for _ in 0..50 {
            let has_ip = self
                .state
                .vms
                .get(vm.as_str())
                .is_some_and(|v| v.nics.iter().any(|n| !n.ip_addrs.is_empty()));
            if has_ip {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(Error::provider(
            "wait-for-net-ip",
            format!("vm {vm} reported no IP address"),
        ))
    }

    async fn logout(&self) -> Result<()> {
        self.state.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ProviderConnector for Simulator {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ProviderClient>> {
        if credentials.username.is_empty() {
            return Err(Error::provider_permanent(
                endpoint.server.clone(),
                "login",
                "no username configured",
            ));
        }
        self.state.logged_out.store(false, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NetworkDeviceSpec;

    fn clone_spec(devices: usize) -> CloneSpec {
        CloneSpec {
            name: "worker-0".to_string(),
            datacenter: "dc0".to_string(),
            template: "ubuntu-2204".to_string(),
            instance_uuid: "machine-uid-1".to_string(),
            devices: (0..devices)
                .map(|_| NetworkDeviceSpec {
                    network_name: "VM Network".to_string(),
                    dhcp4: true,
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Story: Tasks move through queued and running before they finish
    #[tokio::test]
    async fn story_tasks_progress_when_observed() {
        let sim = Simulator::new();
        let task = sim.clone_vm(&clone_spec(1)).await.unwrap();

        let mut states = Vec::new();
        for _ in 0..4 {
            states.push(sim.get_task(&task).await.unwrap().unwrap().state);
        }
        assert_eq!(
            states,
            vec![
                TaskState::Queued,
                TaskState::Running,
                TaskState::Success,
                TaskState::Success
            ]
        );
        assert_eq!(sim.vm_count(), 1);
    }

    /// Story: The cloned VM is found by its instance UUID, then by BIOS UUID
    #[tokio::test]
    async fn story_clone_then_find_power_on_and_destroy() {
        let sim = Simulator::new().with_task_steps(0);
        sim.clone_vm(&clone_spec(2)).await.unwrap();

        let vm = sim
            .find_by_instance_uuid("dc0", "machine-uid-1")
            .await
            .unwrap()
            .expect("vm should exist");
        let props = sim.vm_properties(&vm).await.unwrap();
        assert_eq!(props.power_state, PowerState::PoweredOff);
        assert_eq!(props.nics.len(), 2);
        assert_eq!(
            sim.find_by_bios_uuid("dc0", &props.bios_uuid.to_uppercase())
                .await
                .unwrap(),
            Some(vm.clone())
        );
        assert_eq!(sim.find_by_bios_uuid("dc1", &props.bios_uuid).await.unwrap(), None);

        sim.power_on(&vm).await.unwrap();
        sim.wait_for_net_ip(&vm).await.unwrap();
        let props = sim.vm_properties(&vm).await.unwrap();
        assert_eq!(props.power_state, PowerState::PoweredOn);
        assert!(props.nics.iter().all(|n| n.connected && !n.ip_addrs.is_empty()));

        // A running VM can't be destroyed
        let task = sim.destroy(&vm).await.unwrap();
        let info = sim.get_task(&task).await.unwrap().unwrap();
        assert_eq!(info.state, TaskState::Error);
        assert_eq!(sim.vm_count(), 1);

        sim.power_off(&vm).await.unwrap();
        sim.destroy(&vm).await.unwrap();
        assert_eq!(sim.vm_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_template_fails_the_task() {
        let sim = Simulator::new().with_task_steps(0).with_template("golden");
        let task = sim.clone_vm(&clone_spec(1)).await.unwrap();
        let info = sim.get_task(&task).await.unwrap().unwrap();
        assert_eq!(info.state, TaskState::Error);
        assert!(info.error.unwrap().contains("ubuntu-2204"));
        assert_eq!(sim.vm_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_task_is_not_found() {
        let sim = Simulator::new();
        let task = sim.clone_vm(&clone_spec(1)).await.unwrap();
        sim.expire_task(&task);
        assert_eq!(sim.get_task(&task).await.unwrap(), None);
        assert!(sim.wait_for_task(&task).await.is_err());
    }

    #[tokio::test]
    async fn test_static_addresses_drop_prefix_length() {
        let sim = Simulator::new().with_task_steps(0);
        let mut spec = clone_spec(1);
        spec.devices[0].ip_addrs = vec!["192.168.10.5/24".to_string()];
        sim.clone_vm(&spec).await.unwrap();
        let vm = sim
            .find_by_instance_uuid("dc0", "machine-uid-1")
            .await
            .unwrap()
            .unwrap();
        sim.power_on(&vm).await.unwrap();
        let props = sim.vm_properties(&vm).await.unwrap();
        assert_eq!(props.nics[0].ip_addrs, vec!["192.168.10.5".to_string()]);
    }

    #[tokio::test]
    async fn test_login_requires_username() {
        let sim = Simulator::new();
        let endpoint = Endpoint::new("sim", "dc0");
        assert!(sim
            .connect(&endpoint, &Credentials::default())
            .await
            .is_err());
        let session = sim
            .connect(&endpoint, &Credentials::new("admin", "pw"))
            .await
            .unwrap();
        assert!(session.is_active().await.unwrap());
        session.logout().await.unwrap();
        assert!(!session.is_active().await.unwrap());
    }
}

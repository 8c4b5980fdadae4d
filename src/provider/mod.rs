//! Virtualization provider abstraction layer
//!
//! The controller talks to vSphere only through the [`ProviderClient`] trait: an
//! authenticated session that can find, clone, power and destroy VMs and
//! observe the asynchronous tasks those operations start. Sessions are opened
//! by a [`ProviderConnector`] and shared through the [`crate::session`] cache.
//!
//! # Backends
//!
//! - [`Simulator`] - in-memory vCenter stand-in with deterministic tasks
//!
//! # Example
//!
//! ```text
//! let session = connector.connect(&endpoint, &credentials).await?;
//! let task = session.clone_vm(&spec).await?;
//! let info = session.wait_for_task(&task).await?;
//! ```

mod simulator;

pub use simulator::Simulator;

use std::fmt;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::crd::NetworkDeviceSpec;
use crate::session::{Credentials, Endpoint};
use crate::Result;

/// Opaque reference to an asynchronous provider operation
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskRef(String);

impl TaskRef {
    /// Wrap a raw task reference
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw reference as stored in status
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque reference to a virtual machine
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VmRef(String);

impl VmRef {
    /// Wrap a raw managed object reference
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw reference
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of a provider task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Accepted but not started
    Queued,
    /// Executing
    Running,
    /// Finished successfully
    Success,
    /// Finished with an error
    Error,
    /// A state this controller doesn't know about
    Other(String),
}

impl TaskState {
    /// Parse the provider's wire representation
    ///
    /// Backends hand task states over as vCenter's `TaskInfoState` strings;
    /// anything outside that set is kept verbatim in [`TaskState::Other`].
    pub fn from_wire(s: &str) -> Self {
        match s {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "success" => Self::Success,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns true for success and error
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => f.write_str("queued"),
            Self::Running => f.write_str("running"),
            Self::Success => f.write_str("success"),
            Self::Error => f.write_str("error"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// Snapshot of a provider task
#[derive(Clone, Debug, PartialEq)]
pub struct TaskInfo {
    /// Reference of the task
    pub task_ref: TaskRef,
    /// Current state
    pub state: TaskState,
    /// Operation name (e.g. "CloneVM_Task")
    pub name: String,
    /// Name of the entity the task operates on
    pub entity_name: String,
    /// Localizable description identifier
    pub description_id: String,
    /// Failure message when `state` is [`TaskState::Error`]
    pub error: Option<String>,
}

/// Power state of a VM
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    /// Running
    PoweredOn,
    /// Stopped
    PoweredOff,
    /// Suspended to memory or disk
    Suspended,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoweredOn => f.write_str("poweredOn"),
            Self::PoweredOff => f.write_str("poweredOff"),
            Self::Suspended => f.write_str("suspended"),
        }
    }
}

/// A virtual NIC as reported by the provider
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NicInfo {
    /// Network the NIC is attached to
    pub network_name: String,
    /// MAC address
    pub mac_addr: String,
    /// Whether the NIC is connected
    pub connected: bool,
    /// Addresses reported by the guest tools, unfiltered
    pub ip_addrs: Vec<String>,
}

/// Properties of a VM read from the provider
#[derive(Clone, Debug, PartialEq)]
pub struct VmProperties {
    /// VM name
    pub name: String,
    /// BIOS UUID
    pub bios_uuid: String,
    /// Instance UUID assigned at clone time
    pub instance_uuid: String,
    /// Current power state
    pub power_state: PowerState,
    /// NICs in device order
    pub nics: Vec<NicInfo>,
}

/// Everything the provider needs to clone a VM
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloneSpec {
    /// Name of the new VM
    pub name: String,
    /// Datacenter to place it in
    pub datacenter: String,
    /// Template to clone from
    pub template: String,
    /// Instance UUID to assign; used to find the VM again before it has a
    /// provider ID
    pub instance_uuid: String,
    /// Virtual CPUs, template default when unset
    pub num_cpus: Option<i32>,
    /// Memory in MiB, template default when unset
    pub memory_mib: Option<i64>,
    /// Boot disk size in GiB, template default when unset
    pub disk_gib: Option<i32>,
    /// NICs to attach, in order
    pub devices: Vec<NetworkDeviceSpec>,
    /// Base64 encoded guest bootstrap data
    pub user_data: String,
}

/// Version descriptor of a provider endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderAbout {
    /// Product name (e.g. "VMware vCenter Server")
    pub product: String,
    /// API version (e.g. "6.7.3")
    pub api_version: String,
}

impl ProviderAbout {
    /// Major and minor API version, if the version string parses
    pub fn version(&self) -> Option<(u32, u32)> {
        let mut parts = self.api_version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |m| m.parse().ok())?;
        Some((major, minor))
    }
}

/// An authenticated provider session
///
/// Calls are independent and may be issued concurrently. None of them block
/// on task completion except [`ProviderClient::wait_for_task`] and
/// [`ProviderClient::wait_for_net_ip`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Version descriptor of the endpoint behind this session
    async fn about(&self) -> Result<ProviderAbout>;

    /// Returns true while the session is still authenticated
    async fn is_active(&self) -> Result<bool>;

    /// Find a VM by its BIOS UUID
    async fn find_by_bios_uuid(&self, datacenter: &str, uuid: &str) -> Result<Option<VmRef>>;

    /// Find a VM by the instance UUID assigned at clone time
    async fn find_by_instance_uuid(&self, datacenter: &str, uuid: &str) -> Result<Option<VmRef>>;

    /// Start cloning a VM from a template
    async fn clone_vm(&self, spec: &CloneSpec) -> Result<TaskRef>;

    /// Start powering a VM on
    async fn power_on(&self, vm: &VmRef) -> Result<TaskRef>;

    /// Start powering a VM off
    async fn power_off(&self, vm: &VmRef) -> Result<TaskRef>;

    /// Start destroying a VM
    async fn destroy(&self, vm: &VmRef) -> Result<TaskRef>;

    /// Look a task up; `None` when the provider no longer knows it
    async fn get_task(&self, task: &TaskRef) -> Result<Option<TaskInfo>>;

    /// Block until a task reaches a terminal state
    async fn wait_for_task(&self, task: &TaskRef) -> Result<TaskInfo>;

    /// Read the properties of a VM
    async fn vm_properties(&self, vm: &VmRef) -> Result<VmProperties>;

    /// Block until the VM reports at least one IP address
    async fn wait_for_net_ip(&self, vm: &VmRef) -> Result<()>;

    /// End the session
    async fn logout(&self) -> Result<()>;
}

/// Opens provider sessions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    /// Log in to an endpoint
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<std::sync::Arc<dyn ProviderClient>>;
}

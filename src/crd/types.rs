//! Supporting types for the VSphereMachine and VSphereCluster CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Network configuration of a virtual machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Network devices, one per virtual NIC, in attachment order
    #[serde(default)]
    pub devices: Vec<NetworkDeviceSpec>,

    /// Static routes applied to the guest
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<NetworkRouteSpec>,

    /// CIDR used to pick the address advertised for the API server
    ///
    /// When unset, the first internal address wins.
    #[serde(
        default,
        rename = "preferredAPIServerCidr",
        skip_serializing_if = "Option::is_none"
    )]
    pub preferred_api_server_cidr: Option<String>,
}

/// A single virtual NIC
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDeviceSpec {
    /// Name of the port group or network the NIC attaches to
    pub network_name: String,

    /// Acquire an IPv4 address through DHCP
    #[serde(default)]
    pub dhcp4: bool,

    /// Acquire an IPv6 address through DHCP
    #[serde(default)]
    pub dhcp6: bool,

    /// Static addresses in CIDR notation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addrs: Vec<String>,

    /// IPv4 gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway4: Option<String>,

    /// IPv6 gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway6: Option<String>,

    /// MAC address to assign; the provider generates one when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_addr: Option<String>,

    /// DNS servers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,

    /// DNS search domains
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_domains: Vec<String>,
}

/// A static route
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NetworkRouteSpec {
    /// Destination CIDR
    pub to: String,
    /// Next hop
    pub via: String,
    /// Route metric
    pub metric: i32,
}

/// Observed state of one virtual NIC
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    /// Whether the NIC is connected
    #[serde(default)]
    pub connected: bool,

    /// Addresses reported by the guest tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addrs: Vec<String>,

    /// MAC address of the NIC
    pub mac_addr: String,

    /// Network the NIC is attached to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
}

/// Kind of a machine address, following the Node address conventions
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum MachineAddressType {
    /// Address routable inside the cluster network
    #[serde(rename = "InternalIP")]
    InternalIp,
    /// Address routable from outside the cluster
    #[serde(rename = "ExternalIP")]
    ExternalIp,
    /// Hostname of the machine
    Hostname,
}

/// An address of a machine
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MachineAddress {
    /// Kind of address
    #[serde(rename = "type")]
    pub type_: MachineAddressType,
    /// The address itself
    pub address: String,
}

impl MachineAddress {
    /// Create an internal IP address entry
    pub fn internal_ip(address: impl Into<String>) -> Self {
        Self {
            type_: MachineAddressType::InternalIp,
            address: address.into(),
        }
    }
}

/// Reference to an object by API version, kind and name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    /// API version of the referent
    #[serde(default)]
    pub api_version: String,
    /// Kind of the referent
    #[serde(default)]
    pub kind: String,
    /// Name of the referent
    #[serde(default)]
    pub name: String,
    /// Namespace of the referent (defaults to the referrer's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ObjectRef {
    /// API group of the referent ("" for the core group)
    pub fn group(&self) -> &str {
        match self.api_version.rsplit_once('/') {
            Some((group, _)) => group,
            None => "",
        }
    }
}

/// Lifecycle state of a virtual machine as seen by the provider
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VirtualMachineState {
    /// The provider has no such VM
    #[default]
    NotFound,
    /// The VM exists but a task is in flight or it isn't powered on yet
    Pending,
    /// The VM is powered on and has no outstanding task
    Ready,
    /// The provider reported the VM in an error state
    Error,
}

impl std::fmt::Display for VirtualMachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "notfound"),
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Read-only snapshot of a VM as reported by the provider
///
/// The controller never mutates this view; it only projects fields from it
/// into the VSphereMachine status.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VirtualMachine {
    /// VM name
    pub name: String,
    /// BIOS UUID, the provider-native unique identifier
    pub bios_uuid: String,
    /// Lifecycle state
    pub state: VirtualMachineState,
    /// Observed NICs
    pub network: Vec<NetworkStatus>,
}

impl VirtualMachine {
    /// A view for a VM that doesn't exist
    pub fn not_found(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: VirtualMachineState::NotFound,
            ..Default::default()
        }
    }

    /// A view for a VM with work still outstanding
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: VirtualMachineState::Pending,
            ..Default::default()
        }
    }
}

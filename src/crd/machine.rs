//! VSphereMachine Custom Resource Definition
//!
//! A VSphereMachine is the infrastructure half of a Cluster API Machine. The
//! spec describes the VM that should exist; the status mirrors what the
//! provider reports and is written only by this controller.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{MachineAddress, NetworkSpec, NetworkStatus};
use crate::{DEBUG_ANNOTATION, MACHINE_FINALIZER};

/// Specification for a VSphereMachine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha2",
    kind = "VSphereMachine",
    plural = "vspheremachines",
    shortname = "vsm",
    status = "VSphereMachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".status.providerID"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachineSpec {
    /// Datacenter the VM is placed in
    pub datacenter: String,

    /// Template the VM is cloned from
    pub template: String,

    /// Number of virtual CPUs
    #[serde(
        default,
        rename = "numCPUs",
        skip_serializing_if = "Option::is_none"
    )]
    pub num_cpus: Option<i32>,

    /// Memory size in MiB
    #[serde(
        default,
        rename = "memoryMiB",
        skip_serializing_if = "Option::is_none"
    )]
    pub memory_mib: Option<i64>,

    /// Boot disk size in GiB
    #[serde(
        default,
        rename = "diskGiB",
        skip_serializing_if = "Option::is_none"
    )]
    pub disk_gib: Option<i32>,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkSpec,

    /// Provider ID observed by an external agent (e.g. the cloud provider)
    #[serde(
        default,
        rename = "providerID",
        skip_serializing_if = "Option::is_none"
    )]
    pub provider_id: Option<String>,
}

/// Status for a VSphereMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereMachineStatus {
    /// True once the VM is powered on, networked and has a provider ID
    #[serde(default)]
    pub ready: bool,

    /// Internal addresses of the VM
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Per-NIC observed network state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<NetworkStatus>,

    /// Provider ID derived from the VM's BIOS UUID
    #[serde(
        default,
        rename = "providerID",
        skip_serializing_if = "Option::is_none"
    )]
    pub provider_id: Option<String>,

    /// Reference to the in-flight provider task, empty when none
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_ref: String,

    /// Terminal failure reason; reconciliation stops until it is cleared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    /// Human-readable terminal failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl VSphereMachine {
    /// Namespaced name used in logs and error messages
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Status, or the empty status for a resource that was never reconciled
    pub fn status_or_default(&self) -> VSphereMachineStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Mutable status, created on first access
    pub fn status_mut(&mut self) -> &mut VSphereMachineStatus {
        self.status.get_or_insert_with(Default::default)
    }

    /// In-flight task reference, if any
    pub fn task_ref(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.task_ref.as_str())
            .filter(|t| !t.is_empty())
    }

    /// Returns true if a terminal error is recorded in status
    pub fn has_terminal_error(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.error_reason.is_some() || s.error_message.is_some())
    }

    /// Returns true if the resource is being deleted
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Returns true if the lifecycle finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == MACHINE_FINALIZER)
    }

    /// Add the lifecycle finalizer; no-op when already present
    pub fn add_finalizer(&mut self) {
        if !self.has_finalizer() {
            self.finalizers_mut().push(MACHINE_FINALIZER.to_string());
        }
    }

    /// Remove the lifecycle finalizer
    pub fn remove_finalizer(&mut self) {
        self.finalizers_mut().retain(|f| f != MACHINE_FINALIZER);
    }

    /// Provider ID to look the VM up by: status first, then the spec's
    /// externally observed value
    pub fn known_provider_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.provider_id.as_deref())
            .or(self.spec.provider_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Returns true if verbose object dumps are requested for this resource
    pub fn has_debug_annotation(&self) -> bool {
        self.annotations()
            .get(DEBUG_ANNOTATION)
            .is_some_and(|v| !v.is_empty())
    }
}

//! Cluster API core resources read by the controller
//!
//! Only the fields the VSphereMachine controller consumes are modelled; serde
//! ignores everything else on the wire. These CRDs are owned and installed by
//! Cluster API, never by this controller.

use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ObjectRef;
use crate::{CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL};

/// Cluster API group
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";

/// Machine spec subset
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1alpha2",
    kind = "Machine",
    plural = "machines",
    status = "MachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Bootstrap configuration
    #[serde(default)]
    pub bootstrap: Bootstrap,

    /// Reference to the infrastructure machine backing this Machine
    #[serde(default)]
    pub infrastructure_ref: ObjectRef,

    /// Kubernetes version of the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Provider ID copied from the infrastructure machine
    #[serde(
        default,
        rename = "providerID",
        skip_serializing_if = "Option::is_none"
    )]
    pub provider_id: Option<String>,
}

/// Bootstrap data for a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Rendered bootstrap data (cloud-init), base64 encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Machine status subset
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Machine phase as reported by Cluster API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl Machine {
    /// Returns true once the bootstrap provider has rendered data
    pub fn has_bootstrap_data(&self) -> bool {
        self.spec.bootstrap.data.as_deref().is_some_and(|d| !d.is_empty())
    }

    /// Stable per-machine token used as the VM's instance UUID
    pub fn instance_uuid(&self) -> Option<&str> {
        self.meta().uid.as_deref().filter(|u| !u.is_empty())
    }

    /// Name of the owning cluster from the cluster-name label
    pub fn cluster_name(&self) -> Option<&str> {
        self.labels()
            .get(CLUSTER_NAME_LABEL)
            .map(String::as_str)
            .filter(|n| !n.is_empty())
    }
}

/// Cluster spec subset
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1alpha2",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Reference to the infrastructure cluster (a VSphereCluster)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectRef>,
}

/// Cluster status subset
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// True once the infrastructure cluster reports ready
    #[serde(default)]
    pub infrastructure_ready: bool,
}

impl Cluster {
    /// Returns true once the cluster infrastructure is provisioned
    pub fn infrastructure_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.infrastructure_ready)
    }
}

/// Returns true if the object is a member of the control plane
pub fn is_control_plane_machine<K: ResourceExt>(obj: &K) -> bool {
    obj.labels()
        .get(CONTROL_PLANE_LABEL)
        .is_some_and(|v| !v.is_empty())
}

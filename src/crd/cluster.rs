//! VSphereCluster Custom Resource Definition
//!
//! The VSphereCluster is the infrastructure half of a Cluster API Cluster. This
//! controller only reads it: the vCenter endpoint comes from its spec.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a VSphereCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha2",
    kind = "VSphereCluster",
    plural = "vsphereclusters",
    status = "VSphereClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Server","type":"string","jsonPath":".spec.server"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterSpec {
    /// vCenter server address (host or host:port)
    pub server: String,

    /// Default datacenter for machines that don't name one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
}

/// Status for a VSphereCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereClusterStatus {
    /// True once the cluster infrastructure is provisioned
    #[serde(default)]
    pub ready: bool,
}

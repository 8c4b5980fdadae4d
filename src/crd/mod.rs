//! Custom Resource Definitions used by the controller
//!
//! [`VSphereMachine`] and [`VSphereCluster`] are owned by this controller.
//! [`Machine`] and [`Cluster`] are Cluster API resources it only reads.

mod capi;
mod cluster;
mod machine;
mod types;

pub use capi::{
    is_control_plane_machine, Bootstrap, Cluster, ClusterSpec, ClusterStatus, Machine,
    MachineSpec, MachineStatus, CAPI_GROUP,
};
pub use cluster::{VSphereCluster, VSphereClusterSpec, VSphereClusterStatus};
pub use machine::{VSphereMachine, VSphereMachineSpec, VSphereMachineStatus};
pub use types::{
    MachineAddress, MachineAddressType, NetworkDeviceSpec, NetworkRouteSpec, NetworkSpec,
    NetworkStatus, ObjectRef, VirtualMachine, VirtualMachineState,
};

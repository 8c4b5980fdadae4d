//! CAPV - Cluster API infrastructure controller for vSphere machines
//!
//! Reconciles VSphereMachine resources against a vSphere-shaped virtualization
//! provider: clones, powers on, networks and eventually destroys the backing
//! VM, mirroring provider-observed facts back into the resource status.
//!
//! # Architecture
//!
//! - Reconciles are level-triggered and idempotent. Every pass re-derives the
//!   lifecycle state from the resource status and the provider's view.
//! - Long-running provider tasks are never awaited inside a reconcile. A
//!   detached waiter signals the controller through a per-kind event channel
//!   when the task finishes.
//! - Status is written back with the resource version read at the start of the
//!   reconcile as an optimistic-concurrency precondition.
//!
//! # Modules
//!
//! - [`crd`] - VSphereMachine/VSphereCluster CRDs and the Cluster API types read
//! - [`controller`] - Reconcile entry point, error policy and controller wiring
//! - [`services`] - VM lifecycle steps, selected by provider API version
//! - [`provider`] - Provider client capability traits and the simulator backend
//! - [`session`] - Process-wide provider session cache
//! - [`task`] - In-flight provider task tracking
//! - [`notify`] - Async completion notifier and per-kind event channels
//! - [`provider_id`] - Provider ID encoding/decoding
//! - [`store`] - Resource store abstraction with optimistic concurrency
//! - [`patch`] - Status/finalizer patch helper
//! - [`machines`] - Machine lookup and address helpers
//! - [`config`] - Command line and environment configuration
//! - [`retry`] - Retry helpers
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod config;
pub mod context;
pub mod controller;
pub mod crd;
pub mod error;
pub mod machines;
pub mod notify;
pub mod patch;
pub mod provider;
pub mod provider_id;
pub mod retry;
pub mod services;
pub mod session;
pub mod store;
pub mod task;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known names
// =============================================================================
// Label, annotation and finalizer keys shared with Cluster API and other
// infrastructure controllers. These are part of the wire contract.

/// Finalizer that blocks VSphereMachine deletion until the VM is destroyed
pub const MACHINE_FINALIZER: &str = "vspheremachine.infrastructure.cluster.x-k8s.io";

/// Label carrying the name of the Cluster API cluster an object belongs to
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label marking control plane machines
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Annotation that turns on object dumps for a single resource
pub const DEBUG_ANNOTATION: &str = "vsphere.infrastructure.cluster.x-k8s.io/debug";

/// Scheme prefix of vSphere provider IDs
pub const PROVIDER_ID_PREFIX: &str = "vsphere://";

/// Field manager recorded on every patch this controller sends
pub const FIELD_MANAGER: &str = "capv-controller";

//! VM lifecycle services
//!
//! A [`VirtualMachineService`] drives one VM toward its desired state a step at
//! a time and reports what it sees. Which implementation handles a session is
//! decided at runtime from the endpoint's API version by [`vm_service_for`].

mod vm;

pub use vm::TaskVmService;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::context::MachineContext;
use crate::crd::VirtualMachine;
use crate::provider::ProviderAbout;
use crate::{Error, Result};

/// Oldest API version the task-based service supports
pub const MIN_API_VERSION: (u32, u32) = (6, 5);

/// Find-or-create and destroy of the VM behind a VSphereMachine
///
/// Both operations are single steps: they start at most one provider task,
/// record it in the machine's status and return. Calling them again while a
/// task is in flight only observes it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VirtualMachineService: Send + Sync {
    /// Move the VM one step toward existing, powered on and networked
    async fn reconcile_vm(&self, ctx: &mut MachineContext) -> Result<VirtualMachine>;

    /// Move the VM one step toward not existing
    async fn destroy_vm(&self, ctx: &mut MachineContext) -> Result<VirtualMachine>;
}

/// Select the VM service for an endpoint
///
/// Endpoints older than [`MIN_API_VERSION`], or reporting a version that
/// doesn't parse, are rejected as a configuration error.
pub fn vm_service_for(about: &ProviderAbout) -> Result<Arc<dyn VirtualMachineService>> {
    match about.version() {
        Some(version) if version >= MIN_API_VERSION => {
            debug!(product = %about.product, api_version = %about.api_version, "using task-based VM service");
            Ok(Arc::new(TaskVmService))
        }
        _ => Err(Error::config_for(
            about.product.clone(),
            format!(
                "unsupported API version {:?}, need {}.{} or newer",
                about.api_version, MIN_API_VERSION.0, MIN_API_VERSION.1
            ),
        )),
    }
}

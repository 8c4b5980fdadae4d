//! Shared controller state and per-reconcile machine context

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use crate::crd::{Cluster, Machine, VSphereCluster, VSphereMachine};
use crate::notify::EventChannels;
use crate::patch::PatchHelper;
use crate::provider::ProviderClient;
use crate::services::VirtualMachineService;
use crate::session::{Credentials, SessionCache};
use crate::store::{KubeResourceStore, ResourceStore};

/// Timing knobs of the reconcile loop
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerSettings {
    /// Requeue after every successful reconcile
    pub sync_period: Duration,
    /// Requeue after a retryable error
    pub retry_requeue: Duration,
    /// Requeue after an error that needs an operator to fix something
    pub config_requeue: Duration,
    /// Poll the store after a patch until the new version is visible
    pub verify_patch: bool,
    /// Maximum polls when verifying a patch
    pub verify_attempts: u32,
    /// Pause between polls when verifying a patch
    pub verify_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            sync_period: Duration::from_secs(600),
            retry_requeue: Duration::from_secs(5),
            config_requeue: Duration::from_secs(60),
            verify_patch: true,
            verify_attempts: 10,
            verify_interval: Duration::from_secs(1),
        }
    }
}

/// Controller context shared by every reconcile
///
/// Use [`ControllerContext::builder`] to construct instances:
///
/// ```ignore
/// let ctx = ControllerContext::builder(client, sessions)
///     .credentials(Credentials::new(user, password))
///     .settings(settings)
///     .build();
/// ```
pub struct ControllerContext {
    /// Read and patch access to the cluster's resources
    pub store: Arc<dyn ResourceStore>,
    /// Provider sessions shared across reconciles
    pub sessions: Arc<SessionCache>,
    /// Per-kind channels for completion signals
    pub events: Arc<EventChannels>,
    /// Credentials used for every provider endpoint
    pub credentials: Credentials,
    /// Requeue and verification timing
    pub settings: ControllerSettings,
    /// Fixed VM service; selected per session from the endpoint's version when unset
    pub vm_service: Option<Arc<dyn VirtualMachineService>>,
}

impl ControllerContext {
    /// Create a builder backed by the Kubernetes API
    pub fn builder(client: Client, sessions: Arc<SessionCache>) -> ContextBuilder {
        ContextBuilder::new(client, sessions)
    }

    /// Create a context over an arbitrary store, for unit tests
    #[cfg(test)]
    pub fn for_testing(store: Arc<dyn ResourceStore>, sessions: Arc<SessionCache>) -> Self {
        Self {
            store,
            sessions,
            events: Arc::new(EventChannels::new()),
            credentials: Credentials::new("administrator@vsphere.local", "pass"),
            settings: ControllerSettings {
                verify_attempts: 2,
                verify_interval: Duration::from_millis(1),
                ..Default::default()
            },
            vm_service: None,
        }
    }
}

/// Builder for [`ControllerContext`]
pub struct ContextBuilder {
    client: Client,
    sessions: Arc<SessionCache>,
    store: Option<Arc<dyn ResourceStore>>,
    events: Option<Arc<EventChannels>>,
    credentials: Credentials,
    settings: ControllerSettings,
    vm_service: Option<Arc<dyn VirtualMachineService>>,
}

impl ContextBuilder {
    fn new(client: Client, sessions: Arc<SessionCache>) -> Self {
        Self {
            client,
            sessions,
            store: None,
            events: None,
            credentials: Credentials::new("", ""),
            settings: ControllerSettings::default(),
            vm_service: None,
        }
    }

    /// Set the provider credentials
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set requeue and verification timing
    pub fn settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Share an existing event channel registry
    pub fn events(mut self, events: Arc<EventChannels>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the resource store
    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Pin the VM service instead of selecting it from the endpoint version
    pub fn vm_service(mut self, service: Arc<dyn VirtualMachineService>) -> Self {
        self.vm_service = Some(service);
        self
    }

    /// Build the context
    pub fn build(self) -> ControllerContext {
        ControllerContext {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeResourceStore::new(self.client.clone()))),
            sessions: self.sessions,
            events: self.events.unwrap_or_default(),
            credentials: self.credentials,
            settings: self.settings,
            vm_service: self.vm_service,
        }
    }
}

/// Everything one reconcile of one VSphereMachine works with
///
/// Built after all ancestors resolved and a session is open. The
/// VSphereMachine is the only mutable part; everything else is read-only
/// input.
pub struct MachineContext {
    /// Owning Cluster API cluster
    pub cluster: Cluster,
    /// Infrastructure cluster carrying the endpoint
    pub vsphere_cluster: VSphereCluster,
    /// Owning Cluster API machine
    pub machine: Machine,
    /// The resource being reconciled
    pub vsphere_machine: VSphereMachine,
    /// Provider session for the cluster's endpoint
    pub session: Arc<dyn ProviderClient>,
    /// Snapshot taken before any mutation
    pub patch_helper: PatchHelper,
    /// Where completion waiters post follow-up requests
    pub events: Arc<EventChannels>,
}

impl MachineContext {
    /// Namespaced name of the VSphereMachine
    pub fn key(&self) -> String {
        self.vsphere_machine.key()
    }

    /// Datacenter of the VM: the machine's own, else the cluster default
    pub fn datacenter(&self) -> &str {
        let own = self.vsphere_machine.spec.datacenter.as_str();
        if own.is_empty() {
            self.vsphere_cluster.spec.datacenter.as_deref().unwrap_or_default()
        } else {
            own
        }
    }
}

impl fmt::Display for MachineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VSphereMachine {}", self.key())
    }
}

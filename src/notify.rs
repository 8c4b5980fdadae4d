//! Async completion notifier
//!
//! Provider tasks take minutes. Instead of blocking a reconcile on them, a
//! detached tokio task waits and then posts the resource's key into a per-kind
//! event channel. The controller consumes that channel next to its watches, so
//! the follow-up reconcile is serialized with every other one for the key.
//!
//! Waiters never touch the resource. All mutation happens in the reconcile the
//! signal triggers.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use kube::{Resource, ResourceExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::provider::{ProviderClient, TaskRef, TaskState, VmRef};
use crate::{Error, Result};

/// Key/value pairs describing what a waiter waited for, used for logging
pub type WaitDetails = Vec<(&'static str, String)>;

/// Key of a resource to reconcile again
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReconcileRequest {
    /// Resource name
    pub name: String,
    /// Resource namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
}

struct Channel {
    tx: UnboundedSender<ReconcileRequest>,
    rx: Option<UnboundedReceiver<ReconcileRequest>>,
}

/// Registry of per-kind event channels
///
/// Channels are created on first use from either side, so a waiter may post
/// before the controller has subscribed; requests queue until then.
#[derive(Default)]
pub struct EventChannels {
    channels: DashMap<String, Channel>,
}

fn kind_key<K: Resource<DynamicType = ()>>() -> String {
    format!("{}/{}", K::group(&()), K::kind(&()))
}

impl EventChannels {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender for `K`'s channel
    pub fn sender_for<K: Resource<DynamicType = ()>>(&self) -> UnboundedSender<ReconcileRequest> {
        self.channels
            .entry(kind_key::<K>())
            .or_insert_with(|| {
                let (tx, rx) = unbounded_channel();
                Channel { tx, rx: Some(rx) }
            })
            .tx
            .clone()
    }

    /// Take the receiving end of `K`'s channel
    ///
    /// There is one consumer per kind; later calls return `None`.
    pub fn subscribe<K: Resource<DynamicType = ()>>(
        &self,
    ) -> Option<UnboundedReceiver<ReconcileRequest>> {
        self.channels
            .entry(kind_key::<K>())
            .or_insert_with(|| {
                let (tx, rx) = unbounded_channel();
                Channel { tx, rx: Some(rx) }
            })
            .rx
            .take()
    }
}

/// Run `wait` in the background and ask for `obj` to be reconciled when it
/// completes
///
/// Returns as soon as the waiter is spawned. If `wait` fails the error is
/// logged and no signal is sent; the next watch event or resync picks the
/// resource up instead.
pub fn notify_on_completion<K, F>(
    channels: &Arc<EventChannels>,
    obj: &K,
    wait: F,
) -> Result<JoinHandle<()>>
where
    K: Resource<DynamicType = ()>,
    F: Future<Output = Result<WaitDetails>> + Send + 'static,
{
    let name = obj.meta().name.clone().ok_or_else(|| {
        Error::internal_with_context("notify", format!("{} has no name", K::kind(&())))
    })?;
    let request = ReconcileRequest {
        name,
        namespace: obj.namespace(),
    };
    let kind = K::kind(&()).to_string();
    let tx = channels.sender_for::<K>();

    Ok(tokio::spawn(async move {
        match wait.await {
            Ok(details) => {
                info!(
                    kind = %kind,
                    name = %request.name,
                    namespace = request.namespace.as_deref().unwrap_or_default(),
                    ?details,
                    "triggering reconcile on completion"
                );
                if tx.send(request).is_err() {
                    debug!(kind = %kind, "event channel closed, dropping reconcile request");
                }
            }
            Err(e) => {
                error!(
                    kind = %kind,
                    name = %request.name,
                    error = %e,
                    "failed to wait on func"
                );
            }
        }
    }))
}

/// Wait for a provider task to finish, whatever its outcome
pub async fn wait_for_task(session: Arc<dyn ProviderClient>, task: TaskRef) -> Result<WaitDetails> {
    let info = session.wait_for_task(&task).await?;
    Ok(vec![
        ("reason", "task".to_string()),
        ("task_ref", task.to_string()),
        ("task_name", info.name),
        ("task_entity_name", info.entity_name),
        ("task_state", info.state.to_string()),
        ("task_description_id", info.description_id),
    ])
}

/// Wait for a power-on task to succeed and then for the VM to report an IP
pub async fn wait_for_power_on_then_network(
    session: Arc<dyn ProviderClient>,
    task: TaskRef,
    vm: VmRef,
) -> Result<WaitDetails> {
    let info = session
        .wait_for_task(&task)
        .await
        .map_err(|e| e.during(vm.as_str(), "wait-for-power-on"))?;
    if info.state != TaskState::Success {
        return Err(Error::provider_for(
            vm.as_str(),
            "wait-for-power-on",
            format!("unexpected task state {} for power on op", info.state),
        ));
    }
    session
        .wait_for_net_ip(&vm)
        .await
        .map_err(|e| e.during(vm.as_str(), "wait-for-network"))?;
    Ok(vec![("reason", "network".to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{VSphereMachine, VSphereMachineSpec};
    use crate::provider::{MockProviderClient, TaskInfo};
    use std::time::Duration;

    fn machine() -> VSphereMachine {
        let mut vm = VSphereMachine::new("worker-0", VSphereMachineSpec::default());
        vm.metadata.namespace = Some("default".to_string());
        vm
    }

    fn info(state: TaskState) -> TaskInfo {
        TaskInfo {
            task_ref: TaskRef::new("task-1"),
            state,
            name: "PowerOnVM_Task".to_string(),
            entity_name: "worker-0".to_string(),
            description_id: "VirtualMachine.powerOn".to_string(),
            error: None,
        }
    }

    /// Story: A finished wait posts the machine's key to its kind's channel
    #[tokio::test]
    async fn story_completion_enqueues_reconcile() {
        let channels = Arc::new(EventChannels::new());
        let mut rx = channels.subscribe::<VSphereMachine>().unwrap();

        let handle = notify_on_completion(&channels, &machine(), async {
            Ok(vec![("reason", "task".to_string())])
        })
        .unwrap();
        handle.await.unwrap();

        let request = rx.recv().await.unwrap();
        assert_eq!(request.name, "worker-0");
        assert_eq!(request.namespace.as_deref(), Some("default"));
    }

    /// Story: A failed wait is logged and sends nothing
    #[tokio::test]
    async fn story_failed_wait_sends_no_signal() {
        let channels = Arc::new(EventChannels::new());
        let mut rx = channels.subscribe::<VSphereMachine>().unwrap();

        let handle = notify_on_completion(&channels, &machine(), async {
            Err(Error::provider("wait-for-task", "session expired"))
        })
        .unwrap();
        handle.await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    /// Story: The caller isn't blocked by a slow wait
    #[tokio::test(start_paused = true)]
    async fn story_notifier_returns_before_wait_finishes() {
        let channels = Arc::new(EventChannels::new());
        let mut rx = channels.subscribe::<VSphereMachine>().unwrap();

        let handle = notify_on_completion(&channels, &machine(), async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(WaitDetails::new())
        })
        .unwrap();

        assert!(rx.try_recv().is_err());
        handle.await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_requests_queue_before_subscription() {
        let channels = Arc::new(EventChannels::new());
        notify_on_completion(&channels, &machine(), async { Ok(WaitDetails::new()) })
            .unwrap()
            .await
            .unwrap();

        let mut rx = channels.subscribe::<VSphereMachine>().unwrap();
        assert!(rx.recv().await.is_some());
        assert!(channels.subscribe::<VSphereMachine>().is_none());
    }

    #[test]
    fn test_unnamed_object_is_rejected() {
        let channels = Arc::new(EventChannels::new());
        let mut vm = machine();
        vm.metadata.name = None;
        let err = notify_on_completion(&channels, &vm, async { Ok(WaitDetails::new()) })
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[tokio::test]
    async fn test_wait_for_task_describes_the_task() {
        let mut client = MockProviderClient::new();
        client
            .expect_wait_for_task()
            .returning(|_| Ok(info(TaskState::Error)));

        let details = wait_for_task(Arc::new(client), TaskRef::new("task-1"))
            .await
            .unwrap();
        assert!(details.contains(&("task_state", "error".to_string())));
        assert!(details.contains(&("task_ref", "task-1".to_string())));
    }

    #[tokio::test]
    async fn test_power_on_wait_requires_success_before_network() {
        let mut client = MockProviderClient::new();
        client
            .expect_wait_for_task()
            .returning(|_| Ok(info(TaskState::Error)));
        client.expect_wait_for_net_ip().never();

        let result = wait_for_power_on_then_network(
            Arc::new(client),
            TaskRef::new("task-1"),
            VmRef::new("vm-1"),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_power_on_wait_then_network() {
        let mut client = MockProviderClient::new();
        client
            .expect_wait_for_task()
            .returning(|_| Ok(info(TaskState::Success)));
        client.expect_wait_for_net_ip().times(1).returning(|_| Ok(()));

        let details = wait_for_power_on_then_network(
            Arc::new(client),
            TaskRef::new("task-1"),
            VmRef::new("vm-1"),
        )
        .await
        .unwrap();
        assert_eq!(details, vec![("reason", "network".to_string())]);
    }
}

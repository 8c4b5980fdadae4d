//! In-flight provider task tracking
//!
//! A VSphereMachine records at most one outstanding provider task in
//! `status.taskRef`. These functions only observe that task. They never start
//! a new one, so calling them on every reconcile is safe.

use tracing::{debug, info, warn};

use crate::crd::VSphereMachine;
use crate::provider::{ProviderClient, TaskInfo, TaskRef, TaskState};
use crate::{Error, Result};

/// Look up the task recorded in status
///
/// Returns `None` without calling the provider when no task is recorded. A
/// failed lookup is also treated as `None`, so a provider hiccup can't wedge
/// the machine behind a task nobody can see.
pub async fn find_in_flight_task(
    session: &dyn ProviderClient,
    machine: &VSphereMachine,
) -> Option<TaskInfo> {
    let task_ref = TaskRef::new(machine.task_ref()?);
    match session.get_task(&task_ref).await {
        Ok(task) => task,
        Err(e) => {
            warn!(task_ref = %task_ref, error = %e, "failed to look up task, treating it as gone");
            None
        }
    }
}

/// Reconcile the task recorded in status
///
/// Returns `true` while the task is queued or running. On success, error or a
/// missing task the reference is cleared and `false` is returned. Any other
/// state is an error and leaves the reference in place.
pub async fn reconcile_in_flight_task(
    session: &dyn ProviderClient,
    machine: &mut VSphereMachine,
) -> Result<bool> {
    let Some(task) = find_in_flight_task(session, machine).await else {
        if machine.task_ref().is_some() {
            debug!("recorded task no longer exists, clearing task ref");
        }
        clear_task_ref(machine);
        return Ok(false);
    };

    debug!(
        task_ref = %task.task_ref,
        state = %task.state,
        description_id = %task.description_id,
        "task found"
    );

    match &task.state {
        TaskState::Queued => {
            debug!(task_ref = %task.task_ref, "task is still pending");
            Ok(true)
        }
        TaskState::Running => {
            debug!(task_ref = %task.task_ref, "task is still running");
            Ok(true)
        }
        TaskState::Success => {
            debug!(task_ref = %task.task_ref, "task is a success");
            clear_task_ref(machine);
            Ok(false)
        }
        TaskState::Error => {
            info!(
                task_ref = %task.task_ref,
                description_id = %task.description_id,
                error = task.error.as_deref().unwrap_or_default(),
                "task failed"
            );
            clear_task_ref(machine);
            Ok(false)
        }
        TaskState::Other(state) => Err(Error::unexpected_task_state(
            machine.key(),
            task.task_ref.as_str(),
            state.clone(),
        )),
    }
}

/// Record a newly started task in status
pub fn record_task(machine: &mut VSphereMachine, task: &TaskRef) {
    info!(task_ref = %task, "recording provider task");
    machine.status_mut().task_ref = task.as_str().to_string();
}

fn clear_task_ref(machine: &mut VSphereMachine) {
    if let Some(status) = machine.status.as_mut() {
        status.task_ref.clear();
    }
}

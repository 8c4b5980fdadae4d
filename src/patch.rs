//! Status and finalizer write-back
//!
//! [`PatchHelper`] snapshots a VSphereMachine when a reconcile starts. On exit
//! it diffs the mutated copy against the snapshot and writes only what
//! changed, as JSON merge patches preconditioned on the snapshot's resource
//! version. Status goes first and finalizers last, so removing the finalizer of
//! a deleted machine is the final write.

use kube::{Resource, ResourceExt};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::crd::VSphereMachine;
use crate::store::ResourceStore;
use crate::{Error, Result};

/// Result of writing a machine back
#[derive(Debug)]
pub enum PatchOutcome {
    /// Nothing changed; no request was sent
    Unchanged,
    /// The store accepted the patch and returned this object
    Patched(Box<VSphereMachine>),
    /// The machine disappeared from the store
    Gone,
}

/// Snapshot of a VSphereMachine taken before any mutation
#[derive(Debug, Clone)]
pub struct PatchHelper {
    namespace: String,
    name: String,
    resource_version: String,
    status: Value,
    finalizers: Vec<String>,
}

impl PatchHelper {
    /// Snapshot `machine`
    ///
    /// Fails for an object without name, namespace or resource version; such
    /// an object didn't come from the store.
    pub fn new(machine: &VSphereMachine) -> Result<Self> {
        let missing = |field: &str| {
            Error::internal_with_context(
                "patch",
                format!("VSphereMachine {} has no {field}", machine.name_any()),
            )
        };
        Ok(Self {
            namespace: machine.namespace().ok_or_else(|| missing("namespace"))?,
            name: machine.meta().name.clone().ok_or_else(|| missing("name"))?,
            resource_version: machine
                .resource_version()
                .ok_or_else(|| missing("resourceVersion"))?,
            status: status_value(machine)?,
            finalizers: machine.finalizers().to_vec(),
        })
    }

    /// Resource version the snapshot was taken at
    pub fn resource_version(&self) -> &str {
        &self.resource_version
    }

    /// Write the changes made to `machine` since the snapshot
    ///
    /// Fails with [`Error::Conflict`] when the stored object moved past the
    /// snapshot's resource version.
    pub async fn patch(
        &self,
        store: &dyn ResourceStore,
        machine: &VSphereMachine,
    ) -> Result<PatchOutcome> {
        let mut version = self.resource_version.clone();
        let mut outcome = PatchOutcome::Unchanged;

        if let Some(diff) = merge_patch_diff(&self.status, &status_value(machine)?) {
            let body = serde_json::json!({
                "metadata": { "resourceVersion": version },
                "status": diff,
            });
            debug!(patch = %body, "patching status");
            match store
                .patch_vsphere_machine_status(&self.namespace, &self.name, &body)
                .await
            {
                Ok(stored) => {
                    version = stored.resource_version().unwrap_or_default();
                    outcome = PatchOutcome::Patched(Box::new(stored));
                }
                Err(e) if e.is_not_found() => return Ok(PatchOutcome::Gone),
                Err(e) => return Err(e),
            }
        }

        if machine.finalizers() != self.finalizers.as_slice() {
            let body = serde_json::json!({
                "metadata": {
                    "resourceVersion": version,
                    "finalizers": machine.finalizers(),
                },
            });
            info!(finalizers = ?machine.finalizers(), "patching finalizers");
            match store
                .patch_vsphere_machine(&self.namespace, &self.name, &body)
                .await
            {
                Ok(stored) => outcome = PatchOutcome::Patched(Box::new(stored)),
                Err(e) if e.is_not_found() => return Ok(PatchOutcome::Gone),
                Err(e) => return Err(e),
            }
        }

        Ok(outcome)
    }
}

fn status_value(machine: &VSphereMachine) -> Result<Value> {
    match &machine.status {
        Some(status) => {
            serde_json::to_value(status).map_err(|e| Error::serialization(e.to_string()))
        }
        None => Ok(Value::Object(Map::new())),
    }
}

/// JSON merge patch that turns `before` into `after`, or `None` if they're equal
///
/// Keys missing from `after` are emitted as `null` so the server drops them.
/// Arrays are replaced wholesale.
pub fn merge_patch_diff(before: &Value, after: &Value) -> Option<Value> {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut patch = Map::new();
            for (key, after_value) in a {
                match b.get(key) {
                    Some(before_value) => {
                        if let Some(d) = merge_patch_diff(before_value, after_value) {
                            patch.insert(key.clone(), d);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), after_value.clone());
                    }
                }
            }
            for key in b.keys() {
                if !a.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        _ if before == after => None,
        _ => Some(after.clone()),
    }
}

/// Dotted paths of every leaf that differs between two documents
///
/// Used to describe status drift between the local and stored copies.
pub fn changed_paths(before: &Value, after: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_changed(before, after, String::new(), &mut out);
    out
}

fn collect_changed(before: &Value, after: &Value, prefix: String, out: &mut Vec<String>) {
    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            let mut keys: Vec<&String> = b.keys().chain(a.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                collect_changed(
                    b.get(key).unwrap_or(&Value::Null),
                    a.get(key).unwrap_or(&Value::Null),
                    path,
                    out,
                );
            }
        }
        _ if before == after => {}
        _ => out.push(if prefix.is_empty() {
            ".".to_string()
        } else {
            prefix
        }),
    }
}

/// Status paths that differ between two copies of a machine
pub fn status_diff(local: &VSphereMachine, remote: &VSphereMachine) -> Result<Vec<String>> {
    Ok(changed_paths(&status_value(local)?, &status_value(remote)?))
}

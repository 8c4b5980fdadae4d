//! Resource store access
//!
//! Everything the controller reads or writes in the API server goes through
//! [`ResourceStore`], so reconcile logic can be exercised against an in-memory
//! store in tests. Writes are JSON merge patches that carry
//! `metadata.resourceVersion`; the API server rejects them with a conflict
//! when the stored version moved on.

use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Cluster, Machine, VSphereCluster, VSphereMachine};
use crate::{Error, Result, FIELD_MANAGER};

/// Read/write access to the resources the controller works with
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get a VSphereMachine; `None` if it doesn't exist
    async fn get_vsphere_machine(&self, namespace: &str, name: &str)
        -> Result<Option<VSphereMachine>>;

    /// Get a Cluster API Machine
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>>;

    /// Get a Cluster API Cluster
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>>;

    /// Get a VSphereCluster
    async fn get_vsphere_cluster(&self, namespace: &str, name: &str)
        -> Result<Option<VSphereCluster>>;

    /// List Machines matching a label selector
    async fn list_machines(&self, namespace: &str, selector: &str) -> Result<Vec<Machine>>;

    /// List VSphereMachines matching a label selector
    async fn list_vsphere_machines(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<VSphereMachine>>;

    /// Merge-patch a VSphereMachine's metadata
    ///
    /// `patch` must carry `metadata.resourceVersion`; a stale version fails
    /// with [`Error::Conflict`].
    async fn patch_vsphere_machine(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<VSphereMachine>;

    /// Merge-patch a VSphereMachine's status subresource
    ///
    /// Same precondition rules as [`ResourceStore::patch_vsphere_machine`].
    async fn patch_vsphere_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<VSphereMachine>;
}

/// [`ResourceStore`] backed by the Kubernetes API
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Create a store wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn get_opt<K>(api: Api<K>, name: &str) -> Result<Option<K>>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug,
{
    Ok(api.get_opt(name).await?)
}

fn precondition(patch: &serde_json::Value) -> String {
    patch
        .pointer("/metadata/resourceVersion")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn map_conflict(e: kube::Error, namespace: &str, name: &str, patch: &serde_json::Value) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => {
            Error::conflict(format!("{namespace}/{name}"), precondition(patch))
        }
        other => other.into(),
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_vsphere_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VSphereMachine>> {
        get_opt(self.api(namespace), name).await
    }

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>> {
        get_opt(self.api(namespace), name).await
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
        get_opt(self.api(namespace), name).await
    }

    async fn get_vsphere_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VSphereCluster>> {
        get_opt(self.api(namespace), name).await
    }

    async fn list_machines(&self, namespace: &str, selector: &str) -> Result<Vec<Machine>> {
        let api: Api<Machine> = self.api(namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn list_vsphere_machines(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<VSphereMachine>> {
        let api: Api<VSphereMachine> = self.api(namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }

    async fn patch_vsphere_machine(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<VSphereMachine> {
        let api: Api<VSphereMachine> = self.api(namespace);
        api.patch(name, &patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_conflict(e, namespace, name, patch))
    }

    async fn patch_vsphere_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<VSphereMachine> {
        let api: Api<VSphereMachine> = self.api(namespace);
        api.patch_status(name, &patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_conflict(e, namespace, name, patch))
    }
}

/// Patch parameters for every write, attributed to this controller
pub fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Label selector matching every object of a cluster
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{}={}", crate::CLUSTER_NAME_LABEL, cluster_name)
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory [`ResourceStore`] that enforces resource versions like the
    //! API server does.

    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::ResourceExt;
    use serde_json::Value;

    /// RFC 7386 JSON merge patch
    pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
        let Value::Object(patch_map) = patch else {
            *target = patch.clone();
            return;
        };
        if !target.is_object() {
            *target = Value::Object(Default::default());
        }
        if let Value::Object(target_map) = target {
            for (k, v) in patch_map {
                if v.is_null() {
                    target_map.remove(k);
                } else {
                    apply_merge_patch(target_map.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
    }

    fn key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }

    fn matches_selector(meta: &ObjectMeta, selector: &str) -> bool {
        let labels = meta.labels.clone().unwrap_or_default();
        selector
            .split(',')
            .filter(|s| !s.is_empty())
            .all(|term| match term.split_once('=') {
                Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
                None => labels.contains_key(term),
            })
    }

    /// In-memory resource store
    #[derive(Default)]
    pub struct FakeStore {
        vsphere_machines: Mutex<BTreeMap<String, VSphereMachine>>,
        machines: Mutex<BTreeMap<String, Machine>>,
        clusters: Mutex<BTreeMap<String, Cluster>>,
        vsphere_clusters: Mutex<BTreeMap<String, VSphereCluster>>,
        version: AtomicU64,
        patches: AtomicU64,
    }

    impl FakeStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn next_version(&self) -> String {
            (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
        }

        fn stamp<K: kube::Resource>(&self, mut obj: K) -> (String, K) {
            obj.meta_mut().resource_version = Some(self.next_version());
            if obj.meta().namespace.is_none() {
                obj.meta_mut().namespace = Some("default".to_string());
            }
            let k = key(
                obj.meta().namespace.as_deref().unwrap_or_default(),
                obj.meta().name.as_deref().unwrap_or_default(),
            );
            (k, obj)
        }

        pub fn insert_vsphere_machine(&self, obj: VSphereMachine) -> VSphereMachine {
            let (k, obj) = self.stamp(obj);
            self.vsphere_machines.lock().unwrap().insert(k, obj.clone());
            obj
        }

        pub fn insert_machine(&self, obj: Machine) {
            let (k, obj) = self.stamp(obj);
            self.machines.lock().unwrap().insert(k, obj);
        }

        pub fn insert_cluster(&self, obj: Cluster) {
            let (k, obj) = self.stamp(obj);
            self.clusters.lock().unwrap().insert(k, obj);
        }

        pub fn insert_vsphere_cluster(&self, obj: VSphereCluster) {
            let (k, obj) = self.stamp(obj);
            self.vsphere_clusters.lock().unwrap().insert(k, obj);
        }

        pub fn vsphere_machine(&self, namespace: &str, name: &str) -> Option<VSphereMachine> {
            self.vsphere_machines
                .lock()
                .unwrap()
                .get(&key(namespace, name))
                .cloned()
        }

        /// Number of successful patches
        pub fn patch_count(&self) -> u64 {
            self.patches.load(Ordering::SeqCst)
        }

        fn patch(
            &self,
            namespace: &str,
            name: &str,
            patch: &Value,
            section: &str,
        ) -> Result<VSphereMachine> {
            let k = key(namespace, name);
            let mut objects = self.vsphere_machines.lock().unwrap();
            let current = objects.get(&k).ok_or_else(|| {
                Error::from(kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: format!("vspheremachines {name} not found"),
                    reason: "NotFound".to_string(),
                    code: 404,
                }))
            })?;

            let expected = precondition(patch);
            if !expected.is_empty() && current.resource_version().as_deref() != Some(expected.as_str()) {
                return Err(Error::conflict(k, expected));
            }

            let mut doc = serde_json::to_value(current).unwrap();
            let mut scoped = serde_json::Map::new();
            if let Some(v) = patch.get(section) {
                scoped.insert(section.to_string(), v.clone());
            }
            apply_merge_patch(&mut doc, &Value::Object(scoped));
            let mut updated: VSphereMachine = serde_json::from_value(doc).unwrap();
            updated.metadata.resource_version = Some(self.next_version());
            self.patches.fetch_add(1, Ordering::SeqCst);

            if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
                objects.remove(&k);
            } else {
                objects.insert(k, updated.clone());
            }
            Ok(updated)
        }

        fn get<K: Clone>(
            map: &Mutex<BTreeMap<String, K>>,
            namespace: &str,
            name: &str,
        ) -> Option<K> {
            map.lock().unwrap().get(&key(namespace, name)).cloned()
        }
    }

    #[async_trait]
    impl ResourceStore for FakeStore {
        async fn get_vsphere_machine(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<VSphereMachine>> {
            Ok(Self::get(&self.vsphere_machines, namespace, name))
        }

        async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>> {
            Ok(Self::get(&self.machines, namespace, name))
        }

        async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>> {
            Ok(Self::get(&self.clusters, namespace, name))
        }

        async fn get_vsphere_cluster(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<VSphereCluster>> {
            Ok(Self::get(&self.vsphere_clusters, namespace, name))
        }

        async fn list_machines(&self, namespace: &str, selector: &str) -> Result<Vec<Machine>> {
            Ok(self
                .machines
                .lock()
                .unwrap()
                .values()
                .filter(|m| m.namespace().as_deref() == Some(namespace))
                .filter(|m| matches_selector(&m.metadata, selector))
                .cloned()
                .collect())
        }

        async fn list_vsphere_machines(
            &self,
            namespace: &str,
            selector: &str,
        ) -> Result<Vec<VSphereMachine>> {
            Ok(self
                .vsphere_machines
                .lock()
                .unwrap()
                .values()
                .filter(|m| m.namespace().as_deref() == Some(namespace))
                .filter(|m| matches_selector(&m.metadata, selector))
                .cloned()
                .collect())
        }

        async fn patch_vsphere_machine(
            &self,
            namespace: &str,
            name: &str,
            patch: &Value,
        ) -> Result<VSphereMachine> {
            self.patch(namespace, name, patch, "metadata")
        }

        async fn patch_vsphere_machine_status(
            &self,
            namespace: &str,
            name: &str,
            patch: &Value,
        ) -> Result<VSphereMachine> {
            self.patch(namespace, name, patch, "status")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{apply_merge_patch, FakeStore};
    use super::*;
    use crate::crd::{MachineSpec, VSphereMachineSpec};
    use serde_json::json;

    fn stored_machine(store: &FakeStore) -> VSphereMachine {
        let mut vm = VSphereMachine::new("worker-0", VSphereMachineSpec::default());
        vm.metadata.namespace = Some("default".to_string());
        store.insert_vsphere_machine(vm)
    }

    #[test]
    fn test_writes_are_attributed_to_the_controller() {
        let params = patch_params();
        assert_eq!(params.field_manager.as_deref(), Some("capv-controller"));
        assert!(!params.force);
    }

    /// Story: A writer holding a stale version is rejected
    #[tokio::test]
    async fn story_stale_patch_conflicts() {
        let store = FakeStore::new();
        let vm = stored_machine(&store);
        let rv = vm.metadata.resource_version.clone().unwrap();

        let patch = json!({"metadata": {"resourceVersion": rv}, "status": {"ready": true}});
        let updated = store
            .patch_vsphere_machine_status("default", "worker-0", &patch)
            .await
            .unwrap();
        assert_ne!(updated.metadata.resource_version, Some(rv.clone()));
        assert!(updated.status.unwrap().ready);

        let err = store
            .patch_vsphere_machine_status("default", "worker-0", &patch)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    /// Story: Label selectors scope lists to one cluster
    #[tokio::test]
    async fn story_list_by_cluster_label() {
        let store = FakeStore::new();
        for (name, cluster) in [("m0", "prod"), ("m1", "prod"), ("m2", "dev")] {
            let mut m = Machine::new(name, MachineSpec::default());
            m.metadata.namespace = Some("default".to_string());
            m.metadata.labels = Some(
                [(crate::CLUSTER_NAME_LABEL.to_string(), cluster.to_string())]
                    .into_iter()
                    .collect(),
            );
            store.insert_machine(m);
        }

        let prod = store
            .list_machines("default", &cluster_selector("prod"))
            .await
            .unwrap();
        assert_eq!(prod.len(), 2);
        let other_ns = store
            .list_machines("kube-system", &cluster_selector("prod"))
            .await
            .unwrap();
        assert!(other_ns.is_empty());
    }

    #[test]
    fn test_merge_patch_nulls_remove_keys() {
        let mut doc = json!({"a": {"b": 1, "c": 2}, "d": [1, 2]});
        apply_merge_patch(&mut doc, &json!({"a": {"b": null, "e": 3}, "d": [3]}));
        assert_eq!(doc, json!({"a": {"c": 2, "e": 3}, "d": [3]}));
    }

    #[test]
    fn test_precondition_reads_resource_version() {
        assert_eq!(
            precondition(&json!({"metadata": {"resourceVersion": "42"}})),
            "42"
        );
        assert_eq!(precondition(&json!({"status": {}})), "");
    }
}

//! Machine lookups and address helpers
//!
//! Resolves the Cluster API objects a VSphereMachine hangs off and picks
//! addresses out of what the provider reports.

use std::net::IpAddr;

use kube::ResourceExt;
use tracing::trace;

use crate::crd::{
    Cluster, Machine, MachineAddressType, VSphereCluster, VSphereMachine, CAPI_GROUP,
};
use crate::store::{cluster_selector, ResourceStore};
use crate::{Error, Result};

/// Resolve the Cluster API Machine that owns `machine`
///
/// `None` until the Machine controller has set the owner reference, or when
/// the owner no longer exists.
pub async fn get_owner_machine(
    store: &dyn ResourceStore,
    machine: &VSphereMachine,
) -> Result<Option<Machine>> {
    let namespace = machine.namespace().unwrap_or_default();
    for owner in machine.owner_references() {
        let group = owner
            .api_version
            .rsplit_once('/')
            .map_or("", |(group, _)| group);
        if owner.kind == "Machine" && group == CAPI_GROUP {
            return store.get_machine(&namespace, &owner.name).await;
        }
    }
    Ok(None)
}

/// Resolve the Cluster API Cluster named by `machine`'s cluster-name label
///
/// A missing label reads the same as a missing cluster: not there yet.
pub async fn get_cluster_from_metadata(
    store: &dyn ResourceStore,
    machine: &Machine,
) -> Result<Option<Cluster>> {
    let Some(cluster_name) = machine.cluster_name() else {
        return Ok(None);
    };
    let namespace = machine.namespace().unwrap_or_default();
    store.get_cluster(&namespace, cluster_name).await
}

/// Resolve the VSphereCluster a Cluster's infrastructure reference points to
pub async fn get_vsphere_cluster(
    store: &dyn ResourceStore,
    cluster: &Cluster,
) -> Result<Option<VSphereCluster>> {
    let Some(infra) = cluster.spec.infrastructure_ref.as_ref() else {
        return Ok(None);
    };
    let namespace = infra
        .namespace
        .clone()
        .or_else(|| cluster.namespace())
        .unwrap_or_default();
    store.get_vsphere_cluster(&namespace, &infra.name).await
}

/// All Machines of a cluster
pub async fn machines_in_cluster(
    store: &dyn ResourceStore,
    namespace: &str,
    cluster_name: &str,
) -> Result<Vec<Machine>> {
    store
        .list_machines(namespace, &cluster_selector(cluster_name))
        .await
        .map_err(|e| e.during(format!("{namespace}/{cluster_name}"), "list-machines"))
}

/// All VSphereMachines of a cluster
pub async fn vsphere_machines_in_cluster(
    store: &dyn ResourceStore,
    namespace: &str,
    cluster_name: &str,
) -> Result<Vec<VSphereMachine>> {
    store
        .list_vsphere_machines(namespace, &cluster_selector(cluster_name))
        .await
}

/// An IP network in CIDR notation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Parse `addr/prefix`
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let network: IpAddr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        (prefix <= max).then_some(Self { network, prefix })
    }

    /// Returns true if `ip` is inside this network
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

/// Preferred internal address of a machine
///
/// The first InternalIP in status, restricted to
/// `spec.network.preferredAPIServerCidr` when set.
pub fn preferred_ip_address(machine: &VSphereMachine) -> Result<String> {
    let cidr = match machine.spec.network.preferred_api_server_cidr.as_deref() {
        Some(s) if !s.is_empty() => Some(Cidr::parse(s).ok_or_else(|| {
            Error::validation_for(machine.key(), "error parsing preferred API server CIDR")
        })?),
        _ => None,
    };

    let status = machine.status_or_default();
    status
        .addresses
        .iter()
        .filter(|a| a.type_ == MachineAddressType::InternalIp)
        .find(|a| match &cidr {
            None => true,
            Some(cidr) => a
                .address
                .parse::<IpAddr>()
                .is_ok_and(|ip| cidr.contains(&ip)),
        })
        .map(|a| a.address.clone())
        .ok_or_else(|| Error::validation_for(machine.key(), "no IP addresses found for machine"))
}

/// Drop addresses that are only meaningful on the VM itself
///
/// Loopback, link-local and unspecified addresses are removed; so is anything
/// that doesn't parse as an IP.
pub fn sanitize_ip_addrs(addrs: &[String]) -> Vec<String> {
    addrs
        .iter()
        .filter(|addr| match local_only_reason(addr) {
            Some(reason) => {
                trace!(address = %addr, reason, "ignoring IP address");
                false
            }
            None => true,
        })
        .cloned()
        .collect()
}

fn local_only_reason(addr: &str) -> Option<&'static str> {
    let Ok(ip) = addr.parse::<IpAddr>() else {
        return Some("unparseable");
    };
    if ip.is_loopback() {
        return Some("loopback");
    }
    if ip.is_unspecified() {
        return Some("unspecified");
    }
    let link_local = match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        // fe80::/10
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    };
    link_local.then_some("link-local")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MachineAddress, MachineSpec, ObjectRef, VSphereMachineSpec};
    use crate::store::MockResourceStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use rstest::rstest;

    fn vsphere_machine_with_addresses(addrs: &[&str], cidr: Option<&str>) -> VSphereMachine {
        let mut vm = VSphereMachine::new("worker-0", VSphereMachineSpec::default());
        vm.metadata.namespace = Some("default".to_string());
        vm.spec.network.preferred_api_server_cidr = cidr.map(str::to_string);
        vm.status_mut().addresses = addrs.iter().map(|a| MachineAddress::internal_ip(*a)).collect();
        vm
    }

    fn owner(api_version: &str, kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: "uid".to_string(),
            ..Default::default()
        }
    }

    #[rstest]
    #[case(&["10.0.0.5", "192.168.1.5"], None, Some("10.0.0.5"))]
    #[case(&["10.0.0.5", "192.168.1.5"], Some("192.168.0.0/16"), Some("192.168.1.5"))]
    #[case(&["10.0.0.5"], Some("192.168.0.0/16"), None)]
    #[case(&[], None, None)]
    #[case(&["fd00::5", "10.0.0.5"], Some("fd00::/8"), Some("fd00::5"))]
    fn test_preferred_ip_address(
        #[case] addrs: &[&str],
        #[case] cidr: Option<&str>,
        #[case] expected: Option<&str>,
    ) {
        let vm = vsphere_machine_with_addresses(addrs, cidr);
        match expected {
            Some(ip) => assert_eq!(preferred_ip_address(&vm).unwrap(), ip),
            None => {
                let err = preferred_ip_address(&vm).unwrap_err();
                assert!(err.to_string().contains("no IP addresses found for machine"));
            }
        }
    }

    #[test]
    fn test_preferred_ip_skips_non_internal_addresses() {
        let mut vm = vsphere_machine_with_addresses(&["10.0.0.5"], None);
        vm.status_mut().addresses.insert(
            0,
            MachineAddress {
                type_: MachineAddressType::ExternalIp,
                address: "203.0.113.9".to_string(),
            },
        );
        assert_eq!(preferred_ip_address(&vm).unwrap(), "10.0.0.5");
    }

    #[test]
    fn test_invalid_preferred_cidr_is_an_error() {
        let vm = vsphere_machine_with_addresses(&["10.0.0.5"], Some("10.0.0.0/33"));
        let err = preferred_ip_address(&vm).unwrap_err();
        assert!(err.to_string().contains("CIDR"));
    }

    #[test]
    fn test_sanitize_drops_local_only_addresses() {
        let addrs: Vec<String> = [
            "10.0.0.5",
            "127.0.0.1",
            "::1",
            "169.254.1.1",
            "fe80::250:56ff:fe00:1",
            "0.0.0.0",
            "::",
            "garbage",
            "2001:db8::5",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(
            sanitize_ip_addrs(&addrs),
            vec!["10.0.0.5".to_string(), "2001:db8::5".to_string()]
        );
    }

    #[rstest]
    #[case("10.0.0.0/8", "10.255.1.1", true)]
    #[case("10.0.0.0/8", "11.0.0.1", false)]
    #[case("0.0.0.0/0", "8.8.8.8", true)]
    #[case("10.0.0.5/32", "10.0.0.5", true)]
    #[case("10.0.0.0/8", "fd00::1", false)]
    fn test_cidr_contains(#[case] cidr: &str, #[case] ip: &str, #[case] expected: bool) {
        let cidr = Cidr::parse(cidr).unwrap();
        assert_eq!(cidr.contains(&ip.parse().unwrap()), expected);
    }

    /// Story: Only a Cluster API Machine owner counts
    #[tokio::test]
    async fn story_owner_machine_resolved_through_owner_refs() {
        let mut vm = vsphere_machine_with_addresses(&[], None);
        vm.metadata.owner_references = Some(vec![
            owner("apps/v1", "Machine", "not-capi"),
            owner("cluster.x-k8s.io/v1alpha2", "Machine", "m0"),
        ]);

        let mut store = MockResourceStore::new();
        store
            .expect_get_machine()
            .withf(|ns, name| ns == "default" && name == "m0")
            .returning(|_, name| Ok(Some(Machine::new(name, MachineSpec::default()))));

        let machine = get_owner_machine(&store, &vm).await.unwrap().unwrap();
        assert_eq!(machine.name_any(), "m0");
    }

    /// Story: No owner reference yet means no Machine, not an error
    #[tokio::test]
    async fn story_missing_owner_is_not_an_error() {
        let vm = vsphere_machine_with_addresses(&[], None);
        let mut store = MockResourceStore::new();
        store.expect_get_machine().never();
        assert!(get_owner_machine(&store, &vm).await.unwrap().is_none());
    }

    /// Story: A Machine without the cluster label has no cluster yet
    #[tokio::test]
    async fn story_cluster_requires_label() {
        let mut machine = Machine::new("m0", MachineSpec::default());
        machine.metadata.namespace = Some("default".to_string());
        let mut store = MockResourceStore::new();
        store.expect_get_cluster().never();
        assert!(get_cluster_from_metadata(&store, &machine)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_vsphere_cluster_follows_infrastructure_ref() {
        let mut cluster = Cluster::new("c0", Default::default());
        cluster.metadata.namespace = Some("default".to_string());
        cluster.spec.infrastructure_ref = Some(ObjectRef {
            api_version: "infrastructure.cluster.x-k8s.io/v1alpha2".to_string(),
            kind: "VSphereCluster".to_string(),
            name: "c0-infra".to_string(),
            namespace: None,
        });

        let mut store = MockResourceStore::new();
        store
            .expect_get_vsphere_cluster()
            .withf(|ns, name| ns == "default" && name == "c0-infra")
            .returning(|_, _| Ok(None));
        assert!(get_vsphere_cluster(&store, &cluster).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_machines_in_cluster_uses_label_selector() {
        let mut store = MockResourceStore::new();
        store
            .expect_list_machines()
            .withf(|ns, sel| ns == "default" && sel == "cluster.x-k8s.io/cluster-name=prod")
            .returning(|_, _| Ok(vec![]));
        store
            .expect_list_vsphere_machines()
            .withf(|ns, sel| ns == "default" && sel == "cluster.x-k8s.io/cluster-name=prod")
            .returning(|_, _| Ok(vec![]));

        assert!(machines_in_cluster(&store, "default", "prod")
            .await
            .unwrap()
            .is_empty());
        assert!(vsphere_machines_in_cluster(&store, "default", "prod")
            .await
            .unwrap()
            .is_empty());
    }
}

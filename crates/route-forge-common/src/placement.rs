//! Placement records the engine reconciles against
//!
//! These are read-only projections of the orchestrator's resources. The
//! controller and the routing manager work on these instead of raw CRDs so
//! both can be exercised without an API server.

use std::net::IpAddr;

use kube::ResourceExt;

use crate::crd::{CiliumNode, VirtualMachine};
use crate::VmKey;

/// Where a VM runs and which address it has
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmPlacement {
    /// VM identity
    pub key: VmKey,
    /// Assigned address as reported in status (unparsed)
    pub ip_address: Option<String>,
    /// Hosting node name
    pub node: Option<String>,
    /// Deletion is in progress
    pub deleting: bool,
}

impl VmPlacement {
    /// Hosting node, treating an empty string as unscheduled
    pub fn node_name(&self) -> Option<&str> {
        self.node.as_deref().filter(|n| !n.is_empty())
    }

    /// Assigned address, treating an empty string as unassigned
    pub fn address(&self) -> Option<&str> {
        self.ip_address.as_deref().filter(|a| !a.is_empty())
    }

    /// Whether an update from `old` to `self` changes routing
    pub fn placement_changed(&self, old: &VmPlacement) -> bool {
        self.address() != old.address() || self.node_name() != old.node_name()
    }
}

impl From<&VirtualMachine> for VmPlacement {
    fn from(vm: &VirtualMachine) -> Self {
        let status = vm.status.as_ref();
        Self {
            key: VmKey::from_object(vm),
            ip_address: status.and_then(|s| s.ip_address.clone()),
            node: status.and_then(|s| s.node.clone()),
            deleting: vm.metadata.deletion_timestamp.is_some(),
        }
    }
}

/// A node's overlay address, used as the next hop for VM routes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeOverlay {
    /// Node name
    pub name: String,
    /// CiliumInternalIP, `None` when absent or unparsable
    pub internal_ip: Option<IpAddr>,
}

impl From<&CiliumNode> for NodeOverlay {
    fn from(node: &CiliumNode) -> Self {
        Self {
            name: node.name_any(),
            internal_ip: node
                .spec
                .cilium_internal_ip()
                .and_then(|ip| ip.trim().parse().ok()),
        }
    }
}

/// Resolved route endpoints for one VM
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Addresses {
    /// Overlay address of the hosting node
    pub node_ip: IpAddr,
    /// Address of the VM
    pub vm_ip: IpAddr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CiliumNodeSpec, NodeAddress, VirtualMachineSpec, VirtualMachineStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn vm(ip: Option<&str>, node: Option<&str>) -> VirtualMachine {
        let mut vm = VirtualMachine::new("vm-a", VirtualMachineSpec::default());
        vm.metadata.namespace = Some("ns".into());
        vm.status = Some(VirtualMachineStatus {
            ip_address: ip.map(String::from),
            node: node.map(String::from),
            phase: None,
        });
        vm
    }

    #[test]
    fn placement_from_vm() {
        let p = VmPlacement::from(&vm(Some("10.66.10.7"), Some("node-1")));
        assert_eq!(p.key, VmKey::new("ns", "vm-a"));
        assert_eq!(p.address(), Some("10.66.10.7"));
        assert_eq!(p.node_name(), Some("node-1"));
        assert!(!p.deleting);
    }

    #[test]
    fn deletion_timestamp_marks_deleting() {
        let mut v = vm(Some("10.66.10.7"), Some("node-1"));
        v.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        assert!(VmPlacement::from(&v).deleting);
    }

    #[test]
    fn empty_strings_mean_unset() {
        let p = VmPlacement::from(&vm(Some(""), Some("")));
        assert_eq!(p.address(), None);
        assert_eq!(p.node_name(), None);
    }

    #[test]
    fn placement_changed_only_on_address_or_node() {
        let old = VmPlacement::from(&vm(Some("10.66.10.7"), Some("node-1")));
        let same = old.clone();
        let moved = VmPlacement::from(&vm(Some("10.66.10.7"), Some("node-2")));
        let readdressed = VmPlacement::from(&vm(Some("10.66.10.8"), Some("node-1")));
        assert!(!same.placement_changed(&old));
        assert!(moved.placement_changed(&old));
        assert!(readdressed.placement_changed(&old));
    }

    #[test]
    fn overlay_from_cilium_node() {
        let node = CiliumNode::new(
            "node-1",
            CiliumNodeSpec {
                addresses: vec![NodeAddress {
                    address_type: "CiliumInternalIP".into(),
                    ip: "172.16.0.1".into(),
                }],
            },
        );
        let overlay = NodeOverlay::from(&node);
        assert_eq!(overlay.name, "node-1");
        assert_eq!(overlay.internal_ip, Some("172.16.0.1".parse().unwrap()));
    }

    #[test]
    fn unparsable_overlay_address_is_none() {
        let node = CiliumNode::new(
            "node-1",
            CiliumNodeSpec {
                addresses: vec![NodeAddress {
                    address_type: "CiliumInternalIP".into(),
                    ip: "bogus".into(),
                }],
            },
        );
        assert_eq!(NodeOverlay::from(&node).internal_ip, None);
    }
}

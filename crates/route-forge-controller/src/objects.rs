//! Indexed view of the cluster objects the controller reconciles against

use async_trait::async_trait;
use kube::runtime::reflector::{ObjectRef, Store};

use route_forge_common::crd::{CiliumNode, VirtualMachine};
use route_forge_common::{Error, NodeOverlay, Result, VmKey, VmPlacement};

/// Read access to placement records
#[async_trait]
pub trait ObjectCache: Send + Sync {
    /// Current placement of a VM, `None` when the VM no longer exists
    fn get_vm(&self, key: &VmKey) -> Option<VmPlacement>;

    /// Overlay record of a node
    fn get_node(&self, name: &str) -> Option<NodeOverlay>;

    /// Every known VM
    fn list_vms(&self) -> Vec<VmPlacement>;

    /// Wait until the initial list of every resource has been observed
    async fn wait_until_synced(&self) -> Result<()>;
}

/// [`ObjectCache`] backed by reflector stores
#[derive(Clone)]
pub struct ReflectorCache {
    vms: Store<VirtualMachine>,
    nodes: Store<CiliumNode>,
}

impl ReflectorCache {
    /// Wrap the stores filled by the VirtualMachine and CiliumNode informers
    pub fn new(vms: Store<VirtualMachine>, nodes: Store<CiliumNode>) -> Self {
        Self { vms, nodes }
    }
}

#[async_trait]
impl ObjectCache for ReflectorCache {
    fn get_vm(&self, key: &VmKey) -> Option<VmPlacement> {
        let obj_ref = ObjectRef::new(&key.name).within(&key.namespace);
        self.vms.get(&obj_ref).map(|vm| VmPlacement::from(vm.as_ref()))
    }

    fn get_node(&self, name: &str) -> Option<NodeOverlay> {
        self.nodes
            .get(&ObjectRef::new(name))
            .map(|node| NodeOverlay::from(node.as_ref()))
    }

    fn list_vms(&self) -> Vec<VmPlacement> {
        self.vms
            .state()
            .iter()
            .map(|vm| VmPlacement::from(vm.as_ref()))
            .collect()
    }

    async fn wait_until_synced(&self) -> Result<()> {
        self.vms
            .wait_until_ready()
            .await
            .map_err(|e| Error::setup("virtualmachine-informer", e.to_string()))?;
        self.nodes
            .wait_until_ready()
            .await
            .map_err(|e| Error::setup("ciliumnode-informer", e.to_string()))?;
        Ok(())
    }
}

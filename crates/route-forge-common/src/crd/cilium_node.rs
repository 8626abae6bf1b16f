//! CiliumNode CRD (cilium.io/v2)

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Address type carrying a node's overlay address
pub const CILIUM_INTERNAL_IP: &str = "CiliumInternalIP";

/// CiliumNode as seen by the route engine. Cluster-scoped, named after the node.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cilium.io",
    version = "v2",
    kind = "CiliumNode",
    plural = "ciliumnodes"
)]
#[serde(rename_all = "camelCase")]
pub struct CiliumNodeSpec {
    /// Addresses assigned to the node
    #[serde(default)]
    pub addresses: Vec<NodeAddress>,
}

/// One typed node address
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct NodeAddress {
    /// Address type (InternalIP, ExternalIP, CiliumInternalIP)
    #[serde(rename = "type", default)]
    pub address_type: String,

    /// The address itself
    #[serde(default)]
    pub ip: String,
}

impl CiliumNodeSpec {
    /// The node's CiliumInternalIP, if any
    pub fn cilium_internal_ip(&self) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.address_type == CILIUM_INTERNAL_IP)
            .map(|a| a.ip.as_str())
    }
}
